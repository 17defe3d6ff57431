//! Idle processor parking
//!
//! Idle processors sleep on a futex word instead of spinning. Wake sources
//! (global spawn, cross-thread timer insertion, shutdown) call
//! [`FutexParking::wake_one`] or [`FutexParking::wake_all`].
//!
//! Futex word semantics:
//! - 0 = no wake pending
//! - 1 = wake pending (processors should check for work)
//!
//! When a processor parks:
//! 1. Increment parked count
//! 2. Consume a pending wake, or FUTEX_WAIT on the word while it is 0
//! 3. Decrement parked count on return
//!
//! Wake signals are not queued when nobody is parked; a busy processor
//! rechecks its queues before parking again anyway.

use nix::errno::Errno;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Linux futex-based parking shared by all processors of a runtime
pub struct FutexParking {
    /// 0 = sleep, 1 = wake pending
    futex: AtomicU32,
    /// Count of parked processors
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    /// Park the calling thread until woken or `timeout` elapses
    ///
    /// Returns `true` if woken by a signal. Callers re-check for work either way.
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);

        if self
            .futex
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return true;
        }

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        let result = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };

        self.parked.fetch_sub(1, Ordering::SeqCst);

        if result == 0 {
            // Consume the flag so the next park sleeps again
            self.futex.store(0, Ordering::Release);
            true
        } else {
            // ETIMEDOUT, EAGAIN (word changed before sleeping), EINTR
            let errno = Errno::last();
            !matches!(errno, Errno::ETIMEDOUT | Errno::EAGAIN | Errno::EINTR)
        }
    }

    /// Wake one parked processor
    pub fn wake_one(&self) {
        self.wake(1);
    }

    /// Wake all parked processors
    pub fn wake_all(&self) {
        self.wake(i32::MAX);
    }

    fn wake(&self, count: i32) {
        if self.parked.load(Ordering::Acquire) == 0 {
            return;
        }
        self.futex.store(1, Ordering::Release);
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    /// Number of currently parked processors (hint, may be stale)
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = FutexParking::new();
        let start = Instant::now();
        let woken = parking.park(Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();

        assert!(!woken);
        assert!(elapsed >= Duration::from_millis(40));
        assert_eq!(parking.parked_count(), 0);
    }

    #[test]
    fn test_wake_one() {
        let parking = Arc::new(FutexParking::new());
        let parking2 = Arc::clone(&parking);

        let handle = thread::spawn(move || parking2.park(Some(Duration::from_secs(10))));

        // Give thread time to park
        let deadline = Instant::now() + Duration::from_secs(5);
        while parking.parked_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        parking.wake_one();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wake_without_parked_is_dropped() {
        let parking = FutexParking::new();
        parking.wake_all();
        let woken = parking.park(Some(Duration::from_millis(10)));
        assert!(!woken);
    }
}
