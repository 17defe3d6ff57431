//! Fiber-aware mutex
//!
//! Unlike `std::sync::Mutex`, a contended lock suspends the calling fiber
//! instead of blocking the OS thread.
//!
//! Word states:
//! - `MUTEX_UNLOCKED` (0)
//! - `MUTEX_LOCKED` (1): held, nobody waiting on the futex
//! - `MUTEX_IN_CONTENTION` (2): held, unlock must wake a waiter
//!
//! `lock` first retries `try_lock` a bounded number of times, yielding the
//! fiber between attempts, and only then marks contention and waits.

use super::futex::Futex;
use crate::config::defaults;
use crate::fiber;
use crate::tls;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use ufiber_core::constants::{MUTEX_IN_CONTENTION, MUTEX_LOCKED, MUTEX_UNLOCKED};
use ufiber_core::fatal;

/// Lock word without associated data
#[derive(Debug, Default)]
pub struct RawMutex {
    state: Futex,
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: Futex::new(MUTEX_UNLOCKED),
        }
    }

    /// Single attempt: UNLOCKED -> LOCKED
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(MUTEX_UNLOCKED, MUTEX_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        for _ in 0..spin_count() {
            fiber::yield_now();
            if self.try_lock() {
                return;
            }
        }
        self.lock_contended();
    }

    #[cold]
    fn lock_contended(&self) {
        while self.state.swap(MUTEX_IN_CONTENTION, Ordering::Acquire) != MUTEX_UNLOCKED {
            self.state.wait(MUTEX_IN_CONTENTION);
        }
    }

    /// Release the lock
    ///
    /// Unlocking a mutex that is not locked is a fatal error.
    pub fn unlock(&self) {
        match self.state.swap(MUTEX_UNLOCKED, Ordering::Release) {
            MUTEX_LOCKED => {}
            MUTEX_IN_CONTENTION => {
                self.state.wake_one();
            }
            MUTEX_UNLOCKED => fatal!("unlock of an unlocked mutex"),
            other => fatal!("mutex word corrupted: {}", other),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != MUTEX_UNLOCKED
    }
}

fn spin_count() -> u32 {
    tls::current_processor().map_or(defaults::MUTEX_SPIN_COUNT, |p| {
        p.shared().config.mutex_spin_count
    })
}

/// A mutex protecting a `T`
///
/// ```rust,ignore
/// let counter = Arc::new(Mutex::new(0u64));
/// // In a fiber:
/// *counter.lock() += 1;
/// ```
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock, suspending the fiber while contended
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// The underlying lock word
    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard; unlocks on drop
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    pub(super) mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// Release without running the guard's drop; the caller owns the unlock
    pub(super) fn into_mutex(guard: Self) -> &'a Mutex<T> {
        let mutex = guard.mutex;
        std::mem::forget(guard);
        mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock() {
        let m = RawMutex::new();
        assert!(m.try_lock());
        assert!(m.is_locked());
        assert!(!m.try_lock());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn test_unlock_unlocked_is_fatal() {
        ufiber_core::kprint::set_log_level(ufiber_core::kprint::LogLevel::Off);
        let m = RawMutex::new();
        let err = std::panic::catch_unwind(|| m.unlock()).unwrap_err();
        assert!(err.is::<ufiber_core::InvariantViolation>());
    }

    #[test]
    fn test_guard() {
        let m = Mutex::new(vec![1]);
        m.lock().push(2);
        assert!(m.try_lock().is_some());
        {
            let _g = m.lock();
            assert!(m.try_lock().is_none());
        }
        assert_eq!(m.into_inner(), vec![1, 2]);
    }

    #[test]
    fn test_threads_contend() {
        let m = Arc::new(Mutex::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 40_000);
    }
}
