//! # ufiber-core
//!
//! Core types for the ufiber fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, io_uring and futex handling live in `ufiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state machine and exit outcome
//! - `error` - Error types
//! - `fatal` - Invariant-violation reporting
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod fatal;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::{FiberExit, FiberState};
pub use error::{RuntimeError, RuntimeResult};
pub use fatal::{panic_message, InvariantViolation};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};

/// Runtime-wide constants
pub mod constants {
    /// Page size assumed for stack guard pages
    pub const PAGE_SIZE: usize = 4096;

    /// Smallest fiber stack accepted by the configuration
    pub const MIN_STACK_SIZE: usize = 64 * 1024;

    /// Largest io_uring submission queue the configuration accepts
    pub const MAX_RING_ENTRIES: u32 = 32768;

    /// Mutex futex word: free
    pub const MUTEX_UNLOCKED: u32 = 0;

    /// Mutex futex word: held, no waiters recorded
    pub const MUTEX_LOCKED: u32 = 1;

    /// Mutex futex word: held, waiters may be sleeping
    pub const MUTEX_IN_CONTENTION: u32 = 2;
}
