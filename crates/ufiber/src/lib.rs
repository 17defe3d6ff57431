//! # ufiber - cooperative fibers on io_uring
//!
//! User-space stackful fibers scheduled across a pool of processor threads.
//! Each processor owns an io_uring instance; blocking-style calls made from a
//! fiber suspend only that fiber while the kernel does the work.
//!
//! ## Features
//!
//! - **Stackful fibers**: guard-paged mmap stacks, hand-written context switch
//! - **io_uring reactor**: [`AsyncOp`] turns any supported syscall into a
//!   fiber suspension point, with optional linked timeouts
//! - **Work stealing**: idle processors take half of a busy sibling's queue
//! - **Timers**: one-shot and recurring, driving the reactor's wait timeout
//! - **Synchronization**: futex-based [`Mutex`], [`ConditionVariable`], [`Semaphore`]
//! - **Hooks**: [`hook`] wrappers for `read`, `write`, `connect`, ... that
//!   become asynchronous inside fibers
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use ufiber::{Mutex, Runtime, RuntimeConfig};
//!
//! fn main() -> ufiber::RuntimeResult<()> {
//!     let runtime = Runtime::new(RuntimeConfig::from_env())?;
//!
//!     let total = runtime.block_on(|| {
//!         let counter = Arc::new(Mutex::new(0u64));
//!         for _ in 0..10 {
//!             let counter = Arc::clone(&counter);
//!             ufiber::spawn(move || {
//!                 *counter.lock() += 1;
//!             });
//!         }
//!         ufiber::sleep(std::time::Duration::from_millis(10));
//!         let n = *counter.lock();
//!         n
//!     })?;
//!
//!     println!("total = {}", total);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        spawn(), yield_now(), sleep(), AsyncOp, hook         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Runtime                               │
//! │        global overflow queue, stats, start/shutdown         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Processor │ ◄──► │ Processor │ ◄──► │ Processor │   (steal)
//!    │ run queue │      │ run queue │      │ run queue │
//!    │ io_uring  │      │ io_uring  │      │ io_uring  │
//!    │ timers    │      │ timers    │      │ timers    │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

use std::time::Duration;

// Re-export core types
pub use ufiber_core::{
    FiberExit, FiberId, FiberState, InvariantViolation, RuntimeError, RuntimeResult,
};

// Re-export kprint macros for debug logging
pub use ufiber_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use ufiber_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use ufiber_core::{env_get, env_get_bool, env_get_ms, env_get_opt};

// Re-export runtime types
pub use ufiber_runtime::{
    hook, AsyncOp, ConditionVariable, ConfigError, Futex, Handle, Mutex, MutexGuard, RawMutex,
    Runtime, RuntimeConfig, RuntimeStats, Semaphore, TimerHandle,
};
pub use ufiber_runtime::{
    current_fiber_id, current_processor_id, is_in_fiber, is_processor_thread, yield_now,
};

/// Spawn a fiber on the runtime driving the calling thread
///
/// # Panics
///
/// Panics when called outside a runtime's processor thread (use
/// [`Runtime::spawn`] or a [`Handle`] there) or if the fiber's stack cannot
/// be allocated.
///
/// # Example
///
/// ```ignore
/// runtime.block_on(|| {
///     ufiber::spawn(|| println!("child fiber"));
/// })?;
/// ```
pub fn spawn<F>(f: F) -> FiberId
where
    F: FnOnce() + Send + 'static,
{
    match try_spawn(f) {
        Ok(id) => id,
        Err(e) => panic!("ufiber::spawn failed: {}", e),
    }
}

/// Like [`spawn`], returning an error instead of panicking
pub fn try_spawn<F>(f: F) -> RuntimeResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    Handle::current()
        .ok_or(RuntimeError::NotInRuntime)?
        .try_spawn(f)
}

/// Suspend the current fiber for `duration`
///
/// Outside a fiber this sleeps the OS thread.
pub fn sleep(duration: Duration) {
    ufiber_runtime::sleep(duration)
}

/// Schedule `cb` on the current processor after `period`
///
/// # Panics
///
/// Panics when called outside a runtime's processor thread.
pub fn add_timer<F>(period: Duration, cb: F, recurring: bool) -> TimerHandle
where
    F: Fn() + Send + Sync + 'static,
{
    match Handle::current() {
        Some(handle) => handle.add_timer(period, cb, recurring),
        None => panic!("ufiber::add_timer called outside a runtime"),
    }
}
