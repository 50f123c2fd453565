//! corio-reactor: the per-thread event loop and its collaborators
//!
//! - [`fd_event`]: global per-descriptor registration records
//! - [`reactor`]: the epoll loop, deferred tasks and coroutine resumption
//! - [`timer`]: deadline-ordered callbacks over a timerfd
//! - [`hook`]: blocking-style `accept`/`connect`/`read`/`write`/`sleep`
//!   bridges that suspend the calling coroutine instead of the thread
//!
//! Linux only.

pub mod fd_event;
pub mod hook;
pub mod reactor;
pub mod timer;

pub use fd_event::{fd_event, EventCallback, FdEvent};
pub use reactor::{Reactor, ReactorKind, Task};
pub use timer::{now_ms, Timer, TimerEvent, TimerTask};
