//! Deadline timers over a timerfd
//!
//! A `Timer` keeps a deadline-ordered multimap of [`TimerEvent`]s and one
//! monotonic one-shot timerfd. The descriptor is armed relative to the
//! earliest deadline; when it fires the due events are extracted under the
//! write lock in deadline order, repeating events are reinserted, and the
//! tasks run after the lock is released so a task may schedule or cancel
//! further events freely.

use std::collections::BTreeMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use corio_core::error::CorioResult;
use corio_core::{kdebug, kerror};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The task a timer event runs when it fires.
pub type TimerTask = Arc<dyn Fn() + Send + Sync>;

/// One scheduled deadline.
///
/// The caller keeps an `Arc` handle for cancellation; the timer's map
/// keeps the other until the event fires or is removed.
pub struct TimerEvent {
    deadline_ms: AtomicI64,
    interval_ms: i64,
    repeated: bool,
    canceled: AtomicBool,
    task: TimerTask,
}

impl TimerEvent {
    /// Schedule `task` to run `interval_ms` from now, optionally repeating.
    pub fn new(interval_ms: i64, repeated: bool, task: TimerTask) -> Arc<Self> {
        Arc::new(Self {
            deadline_ms: AtomicI64::new(now_ms() + interval_ms),
            interval_ms,
            repeated,
            canceled: AtomicBool::new(false),
            task,
        })
    }

    #[inline]
    pub fn deadline_ms(&self) -> i64 {
        self.deadline_ms.load(Ordering::Acquire)
    }

    #[inline]
    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    #[inline]
    pub fn is_repeated(&self) -> bool {
        self.repeated
    }

    /// Mark the event canceled. Idempotent; an already-extracted firing
    /// batch still runs this event's task.
    #[inline]
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn rewind(&self) {
        self.deadline_ms
            .store(now_ms() + self.interval_ms, Ordering::Release);
    }
}

/// Deadline-ordered timer source owned by one reactor.
pub struct Timer {
    timer_fd: TimerFd,
    events: RwLock<BTreeMap<i64, Vec<Arc<TimerEvent>>>>,
}

impl Timer {
    pub fn new() -> CorioResult<Self> {
        let timer_fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|e| {
            kerror!("timerfd create failed: {}", e);
            corio_core::CorioError::Os(e as i32)
        })?;
        Ok(Self {
            timer_fd,
            events: RwLock::new(BTreeMap::new()),
        })
    }

    /// The timerfd to register for read interest on the owning reactor.
    pub fn fd(&self) -> RawFd {
        self.timer_fd.as_fd().as_raw_fd()
    }

    /// Insert an event. When it becomes the earliest deadline and
    /// `rearm_if_earlier` is set, the descriptor is re-armed to it.
    pub fn add_timer_event(&self, event: Arc<TimerEvent>, rearm_if_earlier: bool) {
        let deadline = event.deadline_ms();
        let need_rearm = {
            let mut map = self.events.write().unwrap();
            let is_earliest = map
                .first_key_value()
                .map(|(first, _)| deadline < *first)
                .unwrap_or(true);
            map.entry(deadline).or_default().push(event);
            is_earliest
        };
        if need_rearm && rearm_if_earlier {
            self.arm_at(deadline);
        }
    }

    /// Cancel the event and drop it from its deadline bucket.
    ///
    /// The descriptor is not re-armed; a spurious early fire just finds
    /// nothing due.
    pub fn del_timer_event(&self, event: &Arc<TimerEvent>) {
        event.cancel();
        let mut map = self.events.write().unwrap();
        let deadline = event.deadline_ms();
        if let Some(bucket) = map.get_mut(&deadline) {
            bucket.retain(|e| !Arc::ptr_eq(e, event));
            if bucket.is_empty() {
                map.remove(&deadline);
            }
        }
    }

    /// Dispatch due events. Wired as the timerfd's read callback.
    pub fn on_fire(&self) {
        self.drain_fd();

        let now = now_ms();
        let mut due: Vec<Arc<TimerEvent>> = Vec::new();
        {
            let mut map = self.events.write().unwrap();
            while let Some((&deadline, _)) = map.first_key_value() {
                if deadline > now {
                    break;
                }
                let (_, bucket) = map.pop_first().unwrap();
                for event in bucket {
                    if event.is_canceled() {
                        continue;
                    }
                    if event.is_repeated() {
                        event.rewind();
                        map.entry(event.deadline_ms()).or_default().push(event.clone());
                    }
                    due.push(event);
                }
            }
        }

        if let Some(next) = self.earliest_deadline() {
            self.arm_at(next);
        }

        kdebug!("timer fired, {} events due", due.len());
        for event in due {
            (event.task)();
        }
    }

    fn earliest_deadline(&self) -> Option<i64> {
        let map = self.events.read().unwrap();
        map.first_key_value().map(|(k, _)| *k)
    }

    /// Arm the one-shot descriptor to fire at `deadline` (at least 1ms out,
    /// so past-due deadlines still produce a fire).
    fn arm_at(&self, deadline: i64) {
        let delta_ms = (deadline - now_ms()).max(1) as u64;
        let spec = TimeSpec::from(Duration::from_millis(delta_ms));
        if let Err(e) = self
            .timer_fd
            .set(Expiration::OneShot(spec), TimerSetTimeFlags::empty())
        {
            kerror!("timerfd arm failed: {}", e);
        }
    }

    /// Consume the expiration count so level-triggered polling settles.
    fn drain_fd(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
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

    fn counter_task(hits: &'static AtomicUsize) -> TimerTask {
        Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_due_events_fire_in_deadline_order() {
        static ORDER: std::sync::Mutex<Vec<u32>> = std::sync::Mutex::new(Vec::new());

        let timer = Timer::new().unwrap();
        // Already-due deadlines; on_fire must run them ascending
        for (ms, tag) in [(-10i64, 2u32), (-30, 1), (-1, 3)] {
            let event = TimerEvent::new(ms, false, Arc::new(move || {
                ORDER.lock().unwrap().push(tag);
            }));
            timer.add_timer_event(event, false);
        }
        timer.on_fire();
        assert_eq!(*ORDER.lock().unwrap(), vec![1, 2, 3]);
        assert!(timer.earliest_deadline().is_none());
    }

    #[test]
    fn test_canceled_event_does_not_run() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let timer = Timer::new().unwrap();
        let event = TimerEvent::new(-5, false, counter_task(&HITS));
        timer.add_timer_event(event.clone(), false);
        timer.del_timer_event(&event);
        timer.del_timer_event(&event); // idempotent
        timer.on_fire();
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_repeating_event_reinserts() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let timer = Timer::new().unwrap();
        let event = TimerEvent::new(-5, true, counter_task(&HITS));
        timer.add_timer_event(event.clone(), false);

        timer.on_fire();
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        // Reinserted at now + interval, which is already past again
        assert!(timer.earliest_deadline().is_some());

        timer.on_fire();
        assert_eq!(HITS.load(Ordering::SeqCst), 2);

        event.cancel();
        timer.on_fire();
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_not_yet_due_events_stay() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let timer = Timer::new().unwrap();
        let event = TimerEvent::new(60_000, false, counter_task(&HITS));
        timer.add_timer_event(event, true);
        timer.on_fire();
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
        assert!(timer.earliest_deadline().is_some());
    }
}
