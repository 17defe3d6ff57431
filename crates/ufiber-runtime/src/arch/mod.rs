//! Architecture-specific context switching
//!
//! Each backend provides the same narrow surface:
//!
//! - `SavedRegs` - callee-saved register file of a suspended context
//! - `init_context` - prepare a fresh stack so the first switch enters a function
//! - `context_switch` - save the current context and load another
//!
//! Everything above this module goes through [`crate::fiber::Fiber`].

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Signature of the function a fresh context starts in
///
/// Receives the argument passed to `init_context`. It must never return:
/// the trampoline has no frame to return into.
pub type EntryFn = extern "C" fn(usize) -> !;
