//! Counting semaphore

use super::futex::Futex;
use std::sync::atomic::{AtomicU32, Ordering};

/// A non-negative permit counter
///
/// `acquire` suspends the fiber while no permit is available. A release
/// only issues a wake when some acquirer is (or is about to be) waiting.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Futex,
    waiters: AtomicU32,
}

impl Semaphore {
    pub const fn new(permits: u32) -> Self {
        Self {
            count: Futex::new(permits),
            waiters: AtomicU32::new(0),
        }
    }

    /// Take one permit, waiting while none are available
    pub fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            self.waiters.fetch_add(1, Ordering::SeqCst);
            if self.count.load(Ordering::SeqCst) == 0 {
                self.count.wait(0);
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Take one permit if available
    pub fn try_acquire(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Return one permit
    pub fn release(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.count.wake_one();
        }
    }

    /// Permits currently available
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counts() {
        let s = Semaphore::new(2);
        assert!(s.try_acquire());
        s.acquire();
        assert_eq!(s.count(), 0);
        assert!(!s.try_acquire());
        s.release();
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn test_release_wakes_thread() {
        let s = Arc::new(Semaphore::new(0));
        let s2 = Arc::clone(&s);
        let waiter = thread::spawn(move || {
            s2.acquire();
            s2.acquire();
        });
        thread::sleep(std::time::Duration::from_millis(20));
        s.release();
        s.release();
        waiter.join().unwrap();
        assert_eq!(s.count(), 0);
    }
}
