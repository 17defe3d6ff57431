//! Condition variable over a generation counter
//!
//! `wait` samples the generation while the mutex is still held, releases the
//! mutex, and sleeps until a notify bumps the generation. A notify issued
//! between the unlock and the futex wait changes the word, so the wait
//! returns immediately instead of missing it.

use super::futex::Futex;
use super::mutex::{MutexGuard, RawMutex};
use std::sync::atomic::Ordering;

#[derive(Debug, Default)]
pub struct ConditionVariable {
    seq: Futex,
}

impl ConditionVariable {
    pub const fn new() -> Self {
        Self { seq: Futex::new(0) }
    }

    /// Atomically release `mutex`, wait for a notification, relock
    ///
    /// `mutex` must be held by the caller. Spurious wakeups are possible.
    pub fn wait_raw(&self, mutex: &RawMutex) {
        let generation = self.seq.load(Ordering::Acquire);
        mutex.unlock();
        self.seq.wait(generation);
        mutex.lock();
    }

    /// Guard-based [`wait_raw`](Self::wait_raw)
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = MutexGuard::into_mutex(guard);
        self.wait_raw(mutex.raw());
        MutexGuard { mutex }
    }

    /// Wait until `condition` returns false
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        self.seq.wake_one();
    }

    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        self.seq.wake_all();
    }
}
