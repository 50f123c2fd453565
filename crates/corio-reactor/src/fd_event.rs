//! Global fd-event registry
//!
//! One record per file descriptor number, interned on first lookup and
//! kept for the life of the process. A record carries the descriptor's
//! epoll interest, optional read/write callbacks, and an optionally
//! attached suspended coroutine waiting on the descriptor.
//!
//! Records are keyed by the raw fd integer, so a closed-and-reopened fd
//! lands on the same record; callers must detach state before close.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use corio_runtime::Coroutine;
use nix::sys::epoll::EpollFlags;

use corio_core::kerror;

/// A repeatable readiness callback.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Per-descriptor registration record.
pub struct FdEvent {
    fd: RawFd,
    interest: AtomicU32,
    read_cb: Mutex<Option<EventCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    coroutine: Mutex<Option<Arc<Coroutine>>>,
}

impl FdEvent {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            interest: AtomicU32::new(0),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            coroutine: Mutex::new(None),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current epoll interest mask.
    pub fn interest(&self) -> EpollFlags {
        EpollFlags::from_bits_truncate(self.interest.load(Ordering::Acquire) as i32)
    }

    /// Merge `flags` into the interest mask.
    pub fn add_interest(&self, flags: EpollFlags) {
        self.interest
            .fetch_or(flags.bits() as u32, Ordering::AcqRel);
    }

    /// Drop `flags` from the interest mask.
    pub fn remove_interest(&self, flags: EpollFlags) {
        self.interest
            .fetch_and(!(flags.bits() as u32), Ordering::AcqRel);
    }

    /// Clear the whole interest mask.
    pub fn clear_interest(&self) {
        self.interest.store(0, Ordering::Release);
    }

    /// Bind the callback run when the descriptor becomes readable.
    pub fn set_read_callback(&self, cb: Option<EventCallback>) {
        *self.read_cb.lock().unwrap() = cb;
    }

    /// Bind the callback run when the descriptor becomes writable.
    pub fn set_write_callback(&self, cb: Option<EventCallback>) {
        *self.write_cb.lock().unwrap() = cb;
    }

    pub fn read_callback(&self) -> Option<EventCallback> {
        self.read_cb.lock().unwrap().clone()
    }

    pub fn write_callback(&self) -> Option<EventCallback> {
        self.write_cb.lock().unwrap().clone()
    }

    /// Attach the coroutine to resume when the descriptor is ready.
    pub fn attach_coroutine(&self, cor: Arc<Coroutine>) {
        let mut slot = self.coroutine.lock().unwrap();
        if slot.is_some() {
            kerror!("fd {} already has an attached coroutine", self.fd);
        }
        *slot = Some(cor);
    }

    /// Remove and return the attached coroutine, if any.
    pub fn detach_coroutine(&self) -> Option<Arc<Coroutine>> {
        self.coroutine.lock().unwrap().take()
    }

    /// Peek whether a coroutine is attached.
    pub fn has_coroutine(&self) -> bool {
        self.coroutine.lock().unwrap().is_some()
    }

    /// Switch the descriptor to non-blocking mode.
    pub fn set_non_blocking(&self) {
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL, 0);
            if flags < 0 {
                kerror!("fcntl F_GETFL on fd {} failed", self.fd);
                return;
            }
            if flags & libc::O_NONBLOCK == 0
                && libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
            {
                kerror!("fcntl F_SETFL on fd {} failed", self.fd);
            }
        }
    }
}

/// Registry slots, grown by half again whenever an fd outgrows it.
static REGISTRY: RwLock<Vec<Option<Arc<FdEvent>>>> = RwLock::new(Vec::new());

/// Intern the record for `fd`, creating it on first lookup.
pub fn fd_event(fd: RawFd) -> Arc<FdEvent> {
    assert!(fd >= 0, "negative fd has no event record");
    let idx = fd as usize;

    {
        let table = REGISTRY.read().unwrap();
        if let Some(Some(ev)) = table.get(idx) {
            return ev.clone();
        }
    }

    let mut table = REGISTRY.write().unwrap();
    if idx >= table.len() {
        let grown = (table.len() * 3 / 2).max(idx + 1).max(64);
        table.resize(grown, None);
    }
    table[idx]
        .get_or_insert_with(|| Arc::new(FdEvent::new(fd)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interned_once_per_fd() {
        let a = fd_event(2000);
        let b = fd_event(2000);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.fd(), 2000);
    }

    #[test]
    fn test_interest_mask_merge() {
        let ev = fd_event(2001);
        ev.add_interest(EpollFlags::EPOLLIN);
        ev.add_interest(EpollFlags::EPOLLOUT);
        assert_eq!(ev.interest(), EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT);
        ev.remove_interest(EpollFlags::EPOLLIN);
        assert_eq!(ev.interest(), EpollFlags::EPOLLOUT);
        ev.clear_interest();
        assert!(ev.interest().is_empty());
    }

    #[test]
    fn test_coroutine_attach_detach() {
        let ev = fd_event(2002);
        assert!(!ev.has_coroutine());
        let mut stack = vec![0u8; 16 * 1024];
        let cor = Arc::new(Coroutine::new(stack.as_mut_ptr(), stack.len()));
        ev.attach_coroutine(cor.clone());
        assert!(ev.has_coroutine());
        let got = ev.detach_coroutine().unwrap();
        assert!(Arc::ptr_eq(&got, &cor));
        assert!(ev.detach_coroutine().is_none());
    }
}
