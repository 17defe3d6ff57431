//! 32-bit futex word that suspends fibers instead of threads
//!
//! Inside a fiber, waits and wakes go through the processor's io_uring
//! (`FUTEX_WAIT`/`FUTEX_WAKE` ops), so only the fiber blocks. On plain threads
//! they fall back to the `futex(2)` syscall. Both paths use private futexes
//! on the same address, so a thread can wake a fiber and vice versa.

use crate::fiber;
use crate::tls;
use crate::uring_op::AsyncOp;
use std::ops::Deref;
use std::sync::atomic::AtomicU32;
use ufiber_core::ktrace;

/// An atomic u32 with wait/wake
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct Futex(AtomicU32);

impl Futex {
    pub const fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    /// Sleep while the word equals `expected`
    ///
    /// Returns true if woken by a wake call; false if the value already
    /// differed or the wait was interrupted. Callers always re-check.
    pub fn wait(&self, expected: u32) -> bool {
        if tls::is_in_fiber() {
            let res = AsyncOp::new()
                .prep_futex_wait(&self.0, expected)
                .submit_and_park();
            match res {
                0 => true,
                r if r == -libc::EAGAIN || r == -libc::EINTR => false,
                r => {
                    // Ring without futex support; degrade to polling
                    ktrace!("futex wait op failed: errno {}", -r);
                    fiber::yield_now();
                    false
                }
            }
        } else {
            sys_futex(&self.0, libc::FUTEX_WAIT, expected) == 0
        }
    }

    /// Wake up to `count` waiters; returns how many were woken
    pub fn wake(&self, count: u32) -> usize {
        if tls::is_in_fiber() {
            let res = AsyncOp::new()
                .prep_futex_wake(&self.0, count)
                .submit_and_park();
            if res >= 0 {
                return res as usize;
            }
        }
        let count = count.min(i32::MAX as u32);
        sys_futex(&self.0, libc::FUTEX_WAKE, count).max(0) as usize
    }

    #[inline]
    pub fn wake_one(&self) -> usize {
        self.wake(1)
    }

    #[inline]
    pub fn wake_all(&self) -> usize {
        self.wake(i32::MAX as u32)
    }
}

impl Deref for Futex {
    type Target = AtomicU32;

    #[inline]
    fn deref(&self) -> &AtomicU32 {
        &self.0
    }
}

fn sys_futex(word: &AtomicU32, op: libc::c_int, val: u32) -> libc::c_long {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op | libc::FUTEX_PRIVATE_FLAG,
            val,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_value_mismatch_returns() {
        let f = Futex::new(5);
        assert!(!f.wait(4));
    }

    #[test]
    fn test_thread_wake() {
        let f = Arc::new(Futex::new(0));
        let f2 = Arc::clone(&f);
        let waiter = thread::spawn(move || {
            while f2.load(Ordering::Acquire) == 0 {
                f2.wait(0);
            }
        });
        thread::sleep(Duration::from_millis(20));
        f.store(1, Ordering::Release);
        f.wake_all();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wake_without_waiters() {
        let f = Futex::new(0);
        assert_eq!(f.wake_one(), 0);
    }
}
