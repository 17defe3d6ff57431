//! Futex-based synchronization primitives
//!
//! All waits suspend the calling fiber (or block a plain thread) on a
//! [`Futex`] word; the carrier thread keeps running other fibers meanwhile.

mod condvar;
mod futex;
mod mutex;
mod semaphore;

pub use condvar::ConditionVariable;
pub use futex::Futex;
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use semaphore::Semaphore;
