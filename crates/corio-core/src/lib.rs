//! # corio-core
//!
//! Core types for the corio coroutine runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations live in `corio-runtime` and
//! `corio-reactor`.
//!
//! ## Modules
//!
//! - `error` - Error types
//! - `kprint` - Leveled debug printing macros
//! - `env` - Environment variable utilities

pub mod env;
pub mod error;
pub mod kprint;

// Re-exports for convenience
pub use env::{env_get, env_get_bool};
pub use error::{CorioError, CorioResult};
