//! # ufiber-runtime
//!
//! Linux runtime for the ufiber scheduler.
//!
//! This crate provides:
//! - Stackful fibers (architecture-specific context switching, mmap stacks)
//! - Processors: one OS thread, one io_uring and one run queue each
//! - Work stealing between processors and a global overflow queue
//! - Fiber-suspending io_uring operations ([`AsyncOp`]) and timers
//! - Futex-based `Mutex`, `ConditionVariable` and `Semaphore`
//! - Fiber-aware wrappers for blocking POSIX calls ([`hook`])

#[cfg(not(target_os = "linux"))]
compile_error!("ufiber-runtime requires Linux (io_uring)");

pub mod arch;
pub mod config;
pub mod fiber;
pub mod hook;
pub mod parking;
pub mod processor;
pub mod run_queue;
pub mod runtime;
pub mod stack;
pub mod sync;
pub mod timer;
pub mod tls;
pub mod uring_op;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use fiber::{yield_now, Fiber};
pub use hook::{is_hook_enable, set_hook_enable};
pub use processor::Processor;
pub use run_queue::{FreeList, RunQueue};
pub use runtime::{Handle, Runtime, RuntimeStats};
pub use sync::{ConditionVariable, Futex, Mutex, MutexGuard, RawMutex, Semaphore};
pub use timer::{TimerCallback, TimerHandle, TimerSet};
pub use tls::{current_fiber_id, current_processor_id, is_in_fiber, is_processor_thread};
pub use uring_op::{sleep, AsyncOp};
