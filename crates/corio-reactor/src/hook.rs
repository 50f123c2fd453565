//! Blocking-call bridges
//!
//! Drop-in replacements for `accept`, `connect`, `read`, `write` and
//! `sleep` with the usual POSIX signatures, selected explicitly at the
//! call site. When hooking is enabled and the caller runs inside a worker
//! coroutine, a call that would block instead registers the descriptor on
//! the current thread's reactor and yields; readiness (or a timer) resumes
//! the coroutine, which retries the call exactly once and returns that
//! result. On the scheduler coroutine, or with hooking disabled, every
//! function is a straight libc call.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use libc::{c_int, c_uint, c_void, size_t, sockaddr, socklen_t, ssize_t};
use nix::sys::epoll::EpollFlags;

use corio_core::{kdebug, ktrace};
use corio_runtime::sched;

use crate::fd_event::fd_event;
use crate::reactor;
use crate::timer::TimerEvent;

static HOOK_ENABLED: AtomicBool = AtomicBool::new(false);

/// Default time allowed for a hooked `connect` before it reports
/// `ETIMEDOUT` (75 seconds, the usual kernel default).
pub const DEFAULT_CONNECT_TIMEOUT_MS: i64 = 75_000;

static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(DEFAULT_CONNECT_TIMEOUT_MS);

/// Process-wide hook switch. Off by default.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.store(enabled, Ordering::Release);
}

pub fn hook_enabled() -> bool {
    HOOK_ENABLED.load(Ordering::Acquire)
}

/// Override the hooked `connect` timeout.
pub fn set_connect_timeout_ms(ms: i64) {
    CONNECT_TIMEOUT_MS.store(ms.max(1), Ordering::Release);
}

#[inline]
fn bypass() -> bool {
    !hook_enabled() || sched::on_scheduler()
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(v: c_int) {
    unsafe { *libc::__errno_location() = v }
}

#[inline]
fn would_block(err: c_int) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK
}

/// Park the current coroutine until `fd` reports `interest`.
///
/// Attaches the coroutine to the fd's record, registers interest on this
/// thread's reactor and yields. On resume the registration is torn down
/// again; a reactor that already detached the coroutine (stash or
/// handoff) makes the detach here a no-op.
fn wait_on_fd(fd: RawFd, interest: EpollFlags) {
    let record = fd_event(fd);
    record.attach_coroutine(sched::current());
    let r = reactor::current();
    r.add_event(fd, interest);

    sched::yield_now();

    record.detach_coroutine();
    // After a cross-reactor handoff this thread's reactor never saw the
    // fd; its del_event is then a staged no-op
    reactor::current().del_event(fd);
}

/// Hooked `accept(2)`.
///
/// # Safety
/// Same contract as `libc::accept`.
pub unsafe fn accept(sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    if bypass() {
        return libc::accept(sockfd, addr, addrlen);
    }

    fd_event(sockfd).set_non_blocking();
    let n = libc::accept(sockfd, addr, addrlen);
    if n >= 0 || !would_block(errno()) {
        return n;
    }

    ktrace!("accept on fd {} would block, yielding", sockfd);
    wait_on_fd(sockfd, EpollFlags::EPOLLIN);
    libc::accept(sockfd, addr, addrlen)
}

/// Hooked `read(2)`.
///
/// # Safety
/// Same contract as `libc::read`.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    if bypass() {
        return libc::read(fd, buf, count);
    }

    fd_event(fd).set_non_blocking();
    let n = libc::read(fd, buf, count);
    if n >= 0 || !would_block(errno()) {
        return n;
    }

    ktrace!("read on fd {} would block, yielding", fd);
    wait_on_fd(fd, EpollFlags::EPOLLIN);
    libc::read(fd, buf, count)
}

/// Hooked `write(2)`.
///
/// # Safety
/// Same contract as `libc::write`.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    if bypass() {
        return libc::write(fd, buf, count);
    }

    fd_event(fd).set_non_blocking();
    let n = libc::write(fd, buf, count);
    if n >= 0 || !would_block(errno()) {
        return n;
    }

    ktrace!("write on fd {} would block, yielding", fd);
    wait_on_fd(fd, EpollFlags::EPOLLOUT);
    libc::write(fd, buf, count)
}

/// Hooked `connect(2)`.
///
/// A pending connect waits for write readiness under a one-shot timeout
/// timer; when the timer wins the race the call fails with `ETIMEDOUT`.
///
/// # Safety
/// Same contract as `libc::connect`.
pub unsafe fn connect(sockfd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    if bypass() {
        return libc::connect(sockfd, addr, addrlen);
    }

    let record = fd_event(sockfd);
    record.set_non_blocking();

    let n = libc::connect(sockfd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if errno() != libc::EINPROGRESS {
        return n;
    }

    let r = reactor::current();
    let cor = sched::current();
    record.attach_coroutine(cor.clone());
    r.add_event(sockfd, EpollFlags::EPOLLOUT);

    let timed_out = Arc::new(AtomicBool::new(false));
    let flag = timed_out.clone();
    let waker = r.clone();
    let timeout_ms = CONNECT_TIMEOUT_MS.load(Ordering::Acquire);
    let timeout_event = TimerEvent::new(
        timeout_ms,
        false,
        Arc::new(move || {
            flag.store(true, Ordering::Release);
            if let Some(cor) = fd_event(sockfd).detach_coroutine() {
                waker.add_coroutine(cor);
            }
        }),
    );
    r.timer().add_timer_event(timeout_event.clone(), true);

    kdebug!("connect on fd {} in progress, yielding", sockfd);
    sched::yield_now();

    record.detach_coroutine();
    reactor::current().del_event(sockfd);
    r.timer().del_timer_event(&timeout_event);

    // Probe: a second connect on an established socket reports EISCONN
    let n = libc::connect(sockfd, addr, addrlen);
    if n == 0 || errno() == libc::EISCONN {
        return 0;
    }
    if timed_out.load(Ordering::Acquire) {
        set_errno(libc::ETIMEDOUT);
    }
    -1
}

/// Hooked `sleep(3)`. Suspends the coroutine instead of the thread.
pub fn sleep(seconds: c_uint) -> c_uint {
    if bypass() {
        return unsafe { libc::sleep(seconds) };
    }

    let r = reactor::current();
    let cor = sched::current();
    let woken = Arc::new(AtomicBool::new(false));
    let flag = woken.clone();
    let waker = r.clone();
    let event = TimerEvent::new(
        i64::from(seconds) * 1000,
        false,
        Arc::new(move || {
            flag.store(true, Ordering::Release);
            waker.add_coroutine(cor.clone());
        }),
    );
    r.timer().add_timer_event(event, true);

    // Anything else may resume this coroutine early; only the timer task
    // setting the flag ends the sleep
    while !woken.load(Ordering::Acquire) {
        sched::yield_now();
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{self, ReactorKind};
    use std::sync::atomic::AtomicIsize;
    use std::time::{Duration, Instant};

    #[test]
    fn test_hooked_read_yields_until_data_arrives() {
        static GOT: AtomicIsize = AtomicIsize::new(-1);

        set_hook_enabled(true);
        let r = reactor::init_thread(ReactorKind::Main);

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let pool = corio_runtime::pool();
        let cor = pool.acquire().unwrap();
        let stopper = r.clone();
        cor.set_callback(move || {
            let mut buf = [0u8; 16];
            let n = unsafe { read(rd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n == 5 && &buf[..5] == b"hello" {
                GOT.store(n, Ordering::SeqCst);
            }
            stopper.stop();
        });
        r.add_coroutine(cor.clone());

        // Data arrives only after the coroutine has yielded on the fd
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            let n = unsafe { libc::write(wr, b"hello".as_ptr() as *const c_void, 5) };
            assert_eq!(n, 5);
        });

        r.run().unwrap();
        writer.join().unwrap();
        assert_eq!(GOT.load(Ordering::SeqCst), 5);

        pool.release(&cor);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_connect_times_out_on_silent_peer() {
        static RESULT: AtomicIsize = AtomicIsize::new(0);
        static ERRNO: AtomicIsize = AtomicIsize::new(0);

        set_hook_enabled(true);
        set_connect_timeout_ms(300);
        let r = reactor::init_thread(ReactorKind::Main);

        let pool = corio_runtime::pool();
        let cor = pool.acquire().unwrap();
        let stopper = r.clone();
        cor.set_callback(move || {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            assert!(fd >= 0);

            // Non-forwarding test address; the SYN is never answered
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = 81u16.to_be();
            addr.sin_addr.s_addr = u32::from_be_bytes([10, 255, 255, 1]).to_be();

            let n = unsafe {
                connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            };
            RESULT.store(n as isize, Ordering::SeqCst);
            ERRNO.store(errno() as isize, Ordering::SeqCst);
            unsafe { libc::close(fd) };
            stopper.stop();
        });
        r.add_coroutine(cor.clone());

        let started = Instant::now();
        r.run().unwrap();
        pool.release(&cor);

        assert_eq!(RESULT.load(Ordering::SeqCst), -1);
        let err = ERRNO.load(Ordering::SeqCst) as c_int;
        if started.elapsed() >= Duration::from_millis(300) {
            assert_eq!(err, libc::ETIMEDOUT);
        } else {
            // Some environments refuse the route outright before any wait
            assert!(err == libc::ENETUNREACH || err == libc::ECONNREFUSED);
        }
    }

    #[test]
    fn test_sleep_suspends_only_the_coroutine() {
        static SLEPT: AtomicBool = AtomicBool::new(false);

        set_hook_enabled(true);
        let r = reactor::init_thread(ReactorKind::Main);

        let pool = corio_runtime::pool();
        let cor = pool.acquire().unwrap();
        let stopper = r.clone();
        cor.set_callback(move || {
            assert_eq!(sleep(1), 0);
            SLEPT.store(true, Ordering::SeqCst);
            stopper.stop();
        });
        r.add_coroutine(cor.clone());

        let started = Instant::now();
        r.run().unwrap();
        pool.release(&cor);

        assert!(SLEPT.load(Ordering::SeqCst));
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(started.elapsed() < Duration::from_secs(9));
    }

    #[test]
    fn test_scheduler_coroutine_bypasses() {
        // On the scheduler coroutine a hooked read is a plain blocking read
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);

        let payload = b"abc";
        let n = unsafe { libc::write(fds[1], payload.as_ptr() as *const c_void, 3) };
        assert_eq!(n, 3);

        let mut buf = [0u8; 8];
        let n = unsafe { read(fds[0], buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], payload);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
