//! Architecture-specific context switching
//!
//! Provides the saved-register layout and the assembly that swaps
//! execution between two coroutine contexts.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{SavedContext, init_context, context_switch};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{SavedContext, init_context, context_switch};
    } else {
        compile_error!("corio-runtime supports x86_64 and aarch64 only");
    }
}
