//! Per-thread scheduler: the scheduler coroutine and the current pointer
//!
//! Every OS thread that runs coroutines owns exactly one `Scheduler`. It
//! holds the scheduler coroutine (the thread's own native stack) and the
//! pointer to whichever coroutine is currently executing. All switching
//! goes through [`yield_now`] and [`resume`]; only the scheduler coroutine
//! may launch workers, and only a worker's own yield hands control back.
//!
//! The scheduler is an explicit per-thread object with `init_thread` /
//! `teardown_thread`, but the accessors still initialize lazily on first
//! use so callers that never touch setup keep working.

use crate::arch;
use crate::coroutine::Coroutine;

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;

use corio_core::{kdebug, kerror};

/// Per-thread scheduler state.
pub struct Scheduler {
    /// The coroutine representing this thread's native stack
    root: Arc<Coroutine>,

    /// Currently executing coroutine (== root while no worker runs)
    current: RefCell<Arc<Coroutine>>,
}

impl Scheduler {
    fn new() -> Self {
        let root = Arc::new(Coroutine::new_scheduler());
        let current = RefCell::new(root.clone());
        Self { root, current }
    }

    /// The scheduler coroutine handle.
    pub fn scheduler_coroutine(&self) -> Arc<Coroutine> {
        self.root.clone()
    }

    /// The currently executing coroutine handle.
    pub fn current(&self) -> Arc<Coroutine> {
        self.current.borrow().clone()
    }

    /// True while this thread is executing on its native stack.
    pub fn on_scheduler(&self) -> bool {
        Arc::ptr_eq(&self.current.borrow(), &self.root)
    }
}

thread_local! {
    /// This thread's scheduler; null until init_thread (or lazy init)
    static SCHEDULER: Cell<*const Scheduler> = const { Cell::new(ptr::null()) };
}

/// Explicitly create this thread's scheduler. Idempotent.
pub fn init_thread() {
    SCHEDULER.with(|cell| {
        if cell.get().is_null() {
            cell.set(Box::into_raw(Box::new(Scheduler::new())));
        }
    });
}

/// Tear down this thread's scheduler.
///
/// Must only be called from the scheduler coroutine with no live workers;
/// a thread that skips this simply leaks one small allocation at exit.
pub fn teardown_thread() {
    SCHEDULER.with(|cell| {
        let p = cell.replace(ptr::null());
        if !p.is_null() {
            drop(unsafe { Box::from_raw(p as *mut Scheduler) });
        }
    });
}

/// This thread's scheduler, or null if never initialized.
///
/// The returned pointer is stable for the thread's lifetime (the box is
/// only freed by `teardown_thread`), which is what lets switch paths hold
/// it across a context swap without a borrow guard.
#[inline]
fn scheduler_ptr() -> *const Scheduler {
    SCHEDULER.with(|cell| cell.get())
}

#[inline]
fn scheduler_or_init() -> &'static Scheduler {
    let p = scheduler_ptr();
    if p.is_null() {
        init_thread();
    }
    unsafe { &*scheduler_ptr() }
}

/// The currently executing coroutine (lazily creating the scheduler).
pub fn current() -> Arc<Coroutine> {
    scheduler_or_init().current()
}

/// This thread's scheduler coroutine (lazily creating the scheduler).
pub fn scheduler_coroutine() -> Arc<Coroutine> {
    scheduler_or_init().scheduler_coroutine()
}

/// True if no scheduler exists yet or the scheduler coroutine is current.
pub fn on_scheduler() -> bool {
    let p = scheduler_ptr();
    if p.is_null() {
        return true;
    }
    unsafe { (*p).on_scheduler() }
}

/// Suspend the current worker coroutine and switch to the scheduler.
///
/// No-op (logged) if no scheduler exists on this thread or the scheduler
/// coroutine itself is current.
pub fn yield_now() {
    let p = scheduler_ptr();
    if p.is_null() {
        kerror!("yield: no scheduler coroutine on this thread");
        return;
    }
    let sched = unsafe { &*p };

    let cur = sched.current();
    if Arc::ptr_eq(&cur, &sched.root) {
        kerror!("yield: current coroutine is the scheduler");
        return;
    }

    *sched.current.borrow_mut() = sched.root.clone();

    let old = cur.ctx_ptr();
    let new = sched.root.ctx_ptr();
    // No borrows may be live across the swap; the frames above us are
    // frozen on the worker stack until somebody resumes it.
    drop(cur);
    unsafe { arch::context_switch(old, new) };
}

/// Switch from the scheduler coroutine into `cor`.
///
/// Returns when `cor` yields (or parks). No-op (logged) if called off the
/// scheduler coroutine, or if `cor` is not resumable or already current.
pub fn resume(cor: &Arc<Coroutine>) {
    let sched = scheduler_or_init();

    if !sched.on_scheduler() {
        kerror!("resume: only the scheduler coroutine may resume workers");
        return;
    }
    if !cor.can_resume() {
        kerror!("resume: coroutine {} is not resumable", cor.id());
        return;
    }
    if Arc::ptr_eq(cor, &sched.current.borrow()) {
        kdebug!("resume: coroutine {} is already current", cor.id());
        return;
    }

    *sched.current.borrow_mut() = cor.clone();

    let old = sched.root.ctx_ptr();
    let new = cor.ctx_ptr();
    unsafe { arch::context_switch(old, new) };
}
