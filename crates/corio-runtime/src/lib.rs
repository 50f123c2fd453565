//! corio-runtime: stackful coroutines, per-thread scheduling, stack pooling
//!
//! The pieces layer bottom-up:
//! - [`arch`]: saved-register context and the switch primitive
//! - [`coroutine`]: the coroutine control block and entry trampoline
//! - [`sched`]: per-thread scheduler coroutine, yield and resume
//! - [`stack`] / [`pool`]: mmap stack arenas and the global coroutine pool
//!
//! Only Linux on x86_64 and aarch64 is supported.

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod pool;
pub mod sched;
pub mod stack;

pub use config::PoolConfig;
pub use coroutine::Coroutine;
pub use pool::{init_pool, pool, CoroutinePool};
pub use sched::{
    current, init_thread, on_scheduler, resume, scheduler_coroutine, teardown_thread, yield_now,
};
pub use stack::StackArena;
