//! Per-thread epoll reactor
//!
//! One reactor per OS thread, driving descriptor readiness, deferred
//! tasks, timers and coroutine resumption from that thread's scheduler
//! coroutine. Cross-thread callers may stage fd registrations and queue
//! tasks; the owning thread applies them between epoll waits, woken
//! through an eventfd when it is actually blocked.
//!
//! Kinds: a Main reactor resumes every ready coroutine itself; a Sub
//! reactor resumes only the first and hands the rest to a process-wide
//! queue so sibling reactors can pick them up, which is how an IO thread
//! pool load-balances without registering every fd everywhere.

use std::cell::RefCell;
use std::collections::HashSet;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crossbeam_queue::SegQueue;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use corio_core::error::{CorioError, CorioResult};
use corio_core::{kdebug, kerror, kinfo};
use corio_runtime::{sched, Coroutine};

use crate::fd_event::fd_event;
use crate::timer::Timer;

/// Bound on one epoll wait so stop requests are never starved.
/// Overridable through `CORIO_WAIT_TIMEOUT_MS`.
const WAIT_TIMEOUT_MS: u16 = 10_000;

/// Ready events taken per wait; more stay queued in the kernel for the
/// next pass, which keeps one iteration's latency bounded.
const MAX_EVENTS: usize = 10;

/// A unit of deferred work run on the reactor thread.
pub type Task = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorKind {
    /// Resumes all ready coroutines on its own thread
    Main,
    /// Resumes one inline, hands the rest to the cross-reactor queue
    Sub,
}

/// Suspended coroutines handed off between Sub reactors.
static HANDOFF: OnceLock<SegQueue<Arc<Coroutine>>> = OnceLock::new();

fn handoff_queue() -> &'static SegQueue<Arc<Coroutine>> {
    HANDOFF.get_or_init(SegQueue::new)
}

pub struct Reactor {
    epoll: Epoll,
    wake_fd: EventFd,
    kind: ReactorKind,
    /// Owning thread, the only one allowed to run the loop or touch epoll
    owner_tid: libc::pid_t,

    looping: AtomicBool,
    stop_requested: AtomicBool,
    /// True only while blocked inside epoll_wait
    in_wait: AtomicBool,

    tasks: Mutex<Vec<Task>>,
    pending_add: Mutex<Vec<(RawFd, EpollFlags)>>,
    pending_del: Mutex<Vec<RawFd>>,
    /// Fds currently present in the epoll set (owner thread only)
    registered: Mutex<HashSet<RawFd>>,
    /// Coroutine stashed by the event scan, resumed first next iteration
    stashed: Mutex<Option<Arc<Coroutine>>>,

    timer: OnceLock<Arc<Timer>>,
}

thread_local! {
    static REACTOR: RefCell<Option<Arc<Reactor>>> = const { RefCell::new(None) };
}

fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Build this thread's reactor. A thread gets exactly one; building a
/// second is fatal.
pub fn init_thread(kind: ReactorKind) -> Arc<Reactor> {
    REACTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            kerror!("thread {} already owns a reactor", gettid());
            std::process::exit(1);
        }
        let reactor = Arc::new(Reactor::build(kind));
        *slot = Some(reactor.clone());
        reactor
    })
}

/// This thread's reactor, built lazily as a Sub reactor on first use.
pub fn current() -> Arc<Reactor> {
    if let Some(r) = REACTOR.with(|cell| cell.borrow().clone()) {
        return r;
    }
    init_thread(ReactorKind::Sub)
}

/// Forget this thread's reactor handle. Outstanding `Arc`s keep the
/// reactor alive; the thread can no longer run its loop.
pub fn teardown_thread() {
    REACTOR.with(|cell| cell.borrow_mut().take());
}

impl Reactor {
    fn build(kind: ReactorKind) -> Self {
        // Multiplexer or wake descriptor failure leaves nothing to run on
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).unwrap_or_else(|e| {
            kerror!("epoll create failed: {}", e);
            std::process::exit(1);
        });
        let wake_fd = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
        )
        .unwrap_or_else(|e| {
            kerror!("wake eventfd create failed: {}", e);
            std::process::exit(1);
        });

        let wake_raw = wake_fd.as_fd().as_raw_fd();
        epoll
            .add(
                wake_fd.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, wake_raw as u64),
            )
            .unwrap_or_else(|e| {
                kerror!("registering wake fd failed: {}", e);
                std::process::exit(1);
            });

        kinfo!("reactor ({:?}) created on thread {}", kind, gettid());
        Self {
            epoll,
            wake_fd,
            kind,
            owner_tid: gettid(),
            looping: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            in_wait: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            pending_add: Mutex::new(Vec::new()),
            pending_del: Mutex::new(Vec::new()),
            registered: Mutex::new(HashSet::new()),
            stashed: Mutex::new(None),
            timer: OnceLock::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ReactorKind {
        self.kind
    }

    #[inline]
    fn on_owner_thread(&self) -> bool {
        gettid() == self.owner_tid
    }

    #[inline]
    fn wake_raw_fd(&self) -> RawFd {
        self.wake_fd.as_fd().as_raw_fd()
    }

    /// This reactor's timer, created (and registered) on first use.
    pub fn timer(self: &Arc<Self>) -> Arc<Timer> {
        self.timer
            .get_or_init(|| {
                let timer = Arc::new(Timer::new().unwrap_or_else(|e| {
                    kerror!("timer create failed: {}", e);
                    std::process::exit(1);
                }));
                // Ticks are dispatched inline by the event scan; only the
                // read interest is registered here
                self.add_event(timer.fd(), EpollFlags::EPOLLIN);
                timer
            })
            .clone()
    }

    /// Register interest in `flags` for `fd`, merged with any existing
    /// interest. Applied directly on the owner thread, staged otherwise.
    pub fn add_event(&self, fd: RawFd, flags: EpollFlags) {
        fd_event(fd).add_interest(flags);
        if self.on_owner_thread() {
            self.apply_add(fd);
        } else {
            self.pending_add.lock().unwrap().push((fd, flags));
            self.wakeup();
        }
    }

    /// Drop `fd` from the epoll set and clear its interest.
    pub fn del_event(&self, fd: RawFd) {
        fd_event(fd).clear_interest();
        if self.on_owner_thread() {
            self.apply_del(fd);
        } else {
            self.pending_del.lock().unwrap().push(fd);
            self.wakeup();
        }
    }

    fn apply_add(&self, fd: RawFd) {
        let interest = fd_event(fd).interest();
        let mut event = EpollEvent::new(interest, fd as u64);
        let mut registered = self.registered.lock().unwrap();
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let result = if registered.contains(&fd) {
            self.epoll.modify(borrowed, &mut event)
        } else {
            self.epoll.add(borrowed, event)
        };
        match result {
            Ok(()) => {
                registered.insert(fd);
            }
            Err(e) => kerror!("epoll register of fd {} failed: {}", fd, e),
        }
    }

    fn apply_del(&self, fd: RawFd) {
        let mut registered = self.registered.lock().unwrap();
        if !registered.remove(&fd) {
            return;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = self.epoll.delete(borrowed) {
            // The fd may have been closed already; nothing to unhook then
            kdebug!("epoll delete of fd {} failed: {}", fd, e);
        }
    }

    /// Queue work for the next loop pass.
    pub fn add_task(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
        self.wakeup();
    }

    /// Queue a batch of work for the next loop pass.
    pub fn add_tasks(&self, batch: Vec<Task>) {
        if batch.is_empty() {
            return;
        }
        self.tasks.lock().unwrap().extend(batch);
        self.wakeup();
    }

    /// Queue a task that resumes `cor` on this reactor's thread.
    pub fn add_coroutine(&self, cor: Arc<Coroutine>) {
        self.add_task(Box::new(move || sched::resume(&cor)));
    }

    /// Nudge the loop out of its epoll wait. Skipped when the loop is not
    /// blocked, where the pass in progress will pick the work up anyway.
    pub fn wakeup(&self) {
        if !self.in_wait.load(Ordering::Acquire) {
            return;
        }
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wake_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            kerror!("wake eventfd write failed");
        }
    }

    /// Ask the loop to exit after its current iteration. Idempotent and
    /// callable from any thread.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.wakeup();
    }

    #[inline]
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Run the event loop until [`stop`](Self::stop) is observed.
    ///
    /// Must run on the constructing thread, from its scheduler coroutine,
    /// and is not reentrant.
    pub fn run(self: &Arc<Self>) -> CorioResult<()> {
        if !self.on_owner_thread() {
            kerror!("reactor loop started off its owning thread");
            return Err(CorioError::OffReactorThread);
        }
        if self.looping.swap(true, Ordering::AcqRel) {
            kerror!("reactor loop is already running");
            return Err(CorioError::AlreadyLooping);
        }
        sched::init_thread();

        let wait_timeout_ms: u16 =
            corio_core::env_get("CORIO_WAIT_TIMEOUT_MS", WAIT_TIMEOUT_MS);
        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        while !self.stop_requested.load(Ordering::Acquire) {
            // 1. coroutine stashed by the previous event scan goes first
            let stashed = self.stashed.lock().unwrap().take();
            if let Some(cor) = stashed {
                sched::resume(&cor);
            }

            // 2. a Sub reactor adopts coroutines handed off by siblings
            if self.kind == ReactorKind::Sub {
                let queue = handoff_queue();
                while let Some(cor) = queue.pop() {
                    sched::resume(&cor);
                }
            }

            // 3. run this pass's deferred tasks; tasks queued while they
            //    execute wait for the next pass
            let batch = std::mem::take(&mut *self.tasks.lock().unwrap());
            for task in batch {
                task();
            }

            // Tasks and resumed coroutines commonly call stop from this
            // thread, where the wakeup write is skipped; observe it here
            // rather than after another full wait
            if self.stop_requested.load(Ordering::Acquire) {
                break;
            }

            // 4. wait, bounded so stop is observed even when idle
            self.in_wait.store(true, Ordering::Release);
            let n = match self.epoll.wait(&mut events, EpollTimeout::from(wait_timeout_ms)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => 0,
                Err(e) => {
                    self.in_wait.store(false, Ordering::Release);
                    kerror!("epoll wait failed: {}", e);
                    return Err(CorioError::Os(e as i32));
                }
            };
            self.in_wait.store(false, Ordering::Release);

            // 5. event scan
            self.dispatch_ready(&events[..n]);

            // 6. staged cross-thread registrations
            let adds = std::mem::take(&mut *self.pending_add.lock().unwrap());
            for (fd, _) in adds {
                self.apply_add(fd);
            }
            let dels = std::mem::take(&mut *self.pending_del.lock().unwrap());
            for fd in dels {
                self.apply_del(fd);
            }
        }

        self.stop_requested.store(false, Ordering::Release);
        self.looping.store(false, Ordering::Release);
        kinfo!("reactor loop on thread {} exited", self.owner_tid);
        Ok(())
    }

    /// Route one wait's ready events.
    ///
    /// Callback-only events become deferred tasks for the next pass. Of
    /// the coroutine-bearing events, the first is stashed for the next
    /// iteration's step 1; the rest resume inline on a Main reactor or
    /// are detached, unregistered and handed off on a Sub reactor.
    fn dispatch_ready(&self, ready: &[EpollEvent]) {
        let mut follow_up: Vec<Task> = Vec::new();

        for ev in ready {
            let fd = ev.data() as RawFd;
            if fd == self.wake_raw_fd() {
                self.drain_wake_fd();
                continue;
            }

            // Timer ticks dispatch inline so due deadlines do not wait an
            // extra epoll pass behind the deferred-task queue
            if let Some(timer) = self.timer.get() {
                if timer.fd() == fd {
                    timer.on_fire();
                    continue;
                }
            }

            let record = fd_event(fd);
            if let Some(cor) = record.detach_coroutine() {
                let mut stashed = self.stashed.lock().unwrap();
                if stashed.is_none() {
                    *stashed = Some(cor);
                } else if self.kind == ReactorKind::Main {
                    drop(stashed);
                    sched::resume(&cor);
                } else {
                    drop(stashed);
                    self.apply_del(fd);
                    record.clear_interest();
                    handoff_queue().push(cor);
                }
                continue;
            }

            let triggered = ev.events();
            if triggered.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                if let Some(cb) = record.read_callback() {
                    follow_up.push(Box::new(move || cb()));
                }
            }
            if triggered.contains(EpollFlags::EPOLLOUT) {
                if let Some(cb) = record.write_callback() {
                    follow_up.push(Box::new(move || cb()));
                }
            }
        }

        if !follow_up.is_empty() {
            self.tasks.lock().unwrap().extend(follow_up);
        }
    }

    fn drain_wake_fd(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_stop_before_run_is_observed() {
        let reactor = init_thread(ReactorKind::Main);
        reactor.stop();
        reactor.run().unwrap();
        assert!(!reactor.is_looping());
        // stop is idempotent; a second stop then run exits again
        reactor.stop();
        reactor.stop();
        reactor.run().unwrap();
    }

    #[test]
    fn test_tasks_run_on_loop_thread() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let reactor = init_thread(ReactorKind::Main);
        reactor.add_task(Box::new(|| {
            HITS.fetch_add(1, Ordering::SeqCst);
        }));
        let r = reactor.clone();
        reactor.add_task(Box::new(move || {
            HITS.fetch_add(1, Ordering::SeqCst);
            r.stop();
        }));
        reactor.run().unwrap();
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cross_thread_add_task_wakes_loop() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let reactor = init_thread(ReactorKind::Main);
        let remote = reactor.clone();
        let poster = std::thread::spawn(move || {
            // Give the loop time to block in its wait first
            std::thread::sleep(std::time::Duration::from_millis(100));
            let r = remote.clone();
            remote.add_task(Box::new(move || {
                HITS.fetch_add(1, Ordering::SeqCst);
                r.stop();
            }));
        });

        let started = std::time::Instant::now();
        reactor.run().unwrap();
        poster.join().unwrap();
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        // Far below the 10s wait bound, so the wakeup worked
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_timer_events_fire_in_deadline_order_through_loop() {
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());

        let reactor = init_thread(ReactorKind::Main);
        let timer = reactor.timer();

        let first = crate::timer::TimerEvent::new(
            1000,
            false,
            Arc::new(|| ORDER.lock().unwrap().push(1)),
        );
        let stopper = reactor.clone();
        let second = crate::timer::TimerEvent::new(
            3000,
            false,
            Arc::new(move || {
                ORDER.lock().unwrap().push(2);
                stopper.stop();
            }),
        );
        timer.add_timer_event(second, true);
        timer.add_timer_event(first, true);

        let started = std::time::Instant::now();
        reactor.run().unwrap();

        assert_eq!(*ORDER.lock().unwrap(), vec![1, 2]);
        assert!(started.elapsed() >= std::time::Duration::from_millis(1000));
    }

    #[test]
    fn test_two_ready_coroutines_both_resume_on_sub_reactor() {
        // Both readers block, then both descriptors become readable. The
        // scan stashes one coroutine; on a Sub reactor the other travels
        // through the handoff queue and is adopted in step 2.
        static DONE: AtomicUsize = AtomicUsize::new(0);

        crate::hook::set_hook_enabled(true);
        let reactor = init_thread(ReactorKind::Sub);

        let mut pairs = Vec::new();
        for _ in 0..2 {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe {
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
            };
            assert_eq!(rc, 0);
            pairs.push(fds);
        }

        let pool = corio_runtime::pool();
        let mut workers = Vec::new();
        for fds in &pairs {
            let rd = fds[0];
            let stopper = reactor.clone();
            let cor = pool.acquire().unwrap();
            cor.set_callback(move || {
                let mut buf = [0u8; 4];
                let n = unsafe {
                    crate::hook::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                assert_eq!(n, 2);
                if DONE.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    stopper.stop();
                }
            });
            reactor.add_coroutine(cor.clone());
            workers.push(cor);
        }

        let write_ends: Vec<RawFd> = pairs.iter().map(|p| p[1]).collect();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(150));
            for fd in write_ends {
                let n = unsafe { libc::write(fd, b"ok".as_ptr() as *const libc::c_void, 2) };
                assert_eq!(n, 2);
            }
        });

        reactor.run().unwrap();
        writer.join().unwrap();
        assert_eq!(DONE.load(Ordering::SeqCst), 2);

        for cor in &workers {
            pool.release(cor);
        }
        for fds in pairs {
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
        }
    }

    #[test]
    fn test_run_rejects_foreign_thread() {
        let reactor = init_thread(ReactorKind::Sub);
        let handle = std::thread::spawn(move || reactor.run());
        assert_eq!(
            handle.join().unwrap(),
            Err(CorioError::OffReactorThread)
        );
    }
}
