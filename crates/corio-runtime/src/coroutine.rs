//! The stackful coroutine object
//!
//! A `Coroutine` is a saved execution context plus a borrowed stack block
//! and a bound entry callback. It does not schedule itself: switching is
//! driven through [`crate::sched`], and stack ownership stays with the
//! arena/pool that lent the block.
//!
//! Lifecycle: *Fresh* (callback bound, never resumed) → *Running* →
//! *Suspended* (yielded) → back to Running on resume. When the entry
//! callback returns, the coroutine clears its resumable flag and parks
//! itself by yielding; the pool decides when to rebind or recycle it.

use crate::arch::{self, SavedContext};
use crate::sched;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use corio_core::kerror;

/// Entry callback type. FnOnce: a fresh callback must be bound (which
/// re-initializes the saved context) before the coroutine runs again.
pub type EntryCallback = Box<dyn FnOnce() + Send + 'static>;

/// Monotonic coroutine id source (0 is reserved for scheduler coroutines)
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// A single stackful execution context.
///
/// # Ownership and thread safety
///
/// The saved context and callback slot are `UnsafeCell`s guarded by the
/// single-owner invariant: at any instant at most one thread runs or
/// mutates a given coroutine. Suspended coroutines are plain memory with
/// no thread affinity and may be handed to another thread, but the
/// handoff must complete before the other side resumes.
pub struct Coroutine {
    /// Pool slot index, -1 for unpooled (overflow or scheduler) coroutines
    slot: i32,

    /// Diagnostic id (0 = a scheduler coroutine)
    id: u32,

    /// Borrowed stack block; null for the scheduler coroutine
    stack_ptr: *mut u8,
    stack_size: usize,

    /// Saved execution context
    ctx: UnsafeCell<SavedContext>,

    /// Entry callback, taken by the trampoline on first resume
    callback: UnsafeCell<Option<EntryCallback>>,

    /// True while the entry callback is executing
    in_entry: AtomicBool,

    /// True if the coroutine may be resumed
    can_resume: AtomicBool,
}

// Safety: see the single-owner invariant above. All flag accesses are
// atomic; ctx/callback are only touched by the thread that currently
// owns the coroutine.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// The implicit coroutine representing a thread's native stack.
    /// Never takes a callback, never parks.
    pub(crate) fn new_scheduler() -> Self {
        Self {
            slot: -1,
            id: 0,
            stack_ptr: std::ptr::null_mut(),
            stack_size: 0,
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            callback: UnsafeCell::new(None),
            in_entry: AtomicBool::new(false),
            can_resume: AtomicBool::new(false),
        }
    }

    /// A worker coroutine over a caller-supplied stack block.
    ///
    /// The stack is borrowed, not owned; the arena that lent it must
    /// outlive the coroutine.
    pub fn new(stack_ptr: *mut u8, stack_size: usize) -> Self {
        Self::new_indexed(stack_ptr, stack_size, -1)
    }

    /// A worker coroutine carrying its pool slot index.
    pub(crate) fn new_indexed(stack_ptr: *mut u8, stack_size: usize, slot: i32) -> Self {
        assert!(!stack_ptr.is_null(), "worker coroutine needs a stack");
        Self {
            slot,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stack_ptr,
            stack_size,
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            callback: UnsafeCell::new(None),
            in_entry: AtomicBool::new(false),
            can_resume: AtomicBool::new(false),
        }
    }

    /// (Re)bind the entry callback and reset the saved context so the next
    /// resume enters it from the top of the stack.
    ///
    /// Rejected (logged, returns false) on a scheduler coroutine or while
    /// the previous callback is still mid-execution.
    pub fn set_callback<F>(&self, cb: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_scheduler() {
            kerror!("set_callback: scheduler coroutine cannot take a callback");
            return false;
        }
        if self.in_entry.load(Ordering::Acquire) {
            kerror!("set_callback: coroutine {} is mid entry callback", self.id);
            return false;
        }

        unsafe {
            *self.callback.get() = Some(Box::new(cb));
            let top = self.stack_ptr.add(self.stack_size);
            arch::init_context(
                self.ctx.get(),
                top,
                coroutine_main as usize,
                self as *const Coroutine as usize,
            );
        }
        self.can_resume.store(true, Ordering::Release);
        true
    }

    /// True for the implicit per-thread scheduler coroutine.
    #[inline]
    pub fn is_scheduler(&self) -> bool {
        self.stack_ptr.is_null()
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Pool slot index, or -1 if unpooled.
    #[inline]
    pub fn slot(&self) -> i32 {
        self.slot
    }

    #[inline]
    pub fn stack_ptr(&self) -> *mut u8 {
        self.stack_ptr
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn is_in_entry(&self) -> bool {
        self.in_entry.load(Ordering::Acquire)
    }

    #[inline]
    pub fn can_resume(&self) -> bool {
        self.can_resume.load(Ordering::Acquire)
    }

    /// Clear the resumable flag (retire the coroutine until rebound).
    #[inline]
    pub fn retire(&self) {
        self.can_resume.store(false, Ordering::Release);
    }

    /// Raw pointer to the saved context, for the switch paths.
    #[inline]
    pub(crate) fn ctx_ptr(&self) -> *mut SavedContext {
        self.ctx.get()
    }
}

/// Entry point every worker coroutine starts in.
///
/// Runs the bound callback with the in-entry flag set, retires the
/// coroutine when it returns, then parks by yielding. A parked coroutine
/// is never destroyed here; rebinding a callback resets the context and
/// abandons the parked frame.
extern "C" fn coroutine_main(cor: usize) {
    let cor = unsafe { &*(cor as *const Coroutine) };

    let cb = unsafe { (*cor.callback.get()).take() };
    if let Some(cb) = cb {
        cor.in_entry.store(true, Ordering::Release);
        cb();
        cor.in_entry.store(false, Ordering::Release);
    }

    cor.retire();
    loop {
        sched::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_rejects_callback() {
        let cor = Coroutine::new_scheduler();
        assert!(cor.is_scheduler());
        assert!(!cor.set_callback(|| {}));
        assert!(!cor.can_resume());
    }

    #[test]
    fn test_worker_callback_bind() {
        let mut stack = vec![0u8; 16 * 1024];
        let cor = Coroutine::new(stack.as_mut_ptr(), stack.len());
        assert_eq!(cor.slot(), -1);
        assert!(!cor.can_resume());
        assert!(cor.set_callback(|| {}));
        assert!(cor.can_resume());
        assert!(!cor.is_in_entry());
    }
}
