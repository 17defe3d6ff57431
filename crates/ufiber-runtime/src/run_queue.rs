//! Ready queues and the fiber free list
//!
//! Design:
//! - One [`RunQueue`] per processor plus one global overflow queue
//! - FIFO within a queue (`VecDeque` behind a `parking_lot::Mutex`)
//! - Stealing moves the front half (rounded up) of a victim into the thief,
//!   holding both locks in address order
//! - A mirrored atomic length lets idle scans skip empty queues without locking
//! - Terminated fibers go to the owning processor's [`FreeList`] and are
//!   reinitialized for the next spawn instead of mapping a new stack

use crate::fiber::{Entry, Fiber};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use ufiber_core::error::RuntimeResult;

/// Thread-safe FIFO of ready fibers
pub struct RunQueue {
    tasks: Mutex<VecDeque<Box<Fiber>>>,
    len: AtomicUsize,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::with_capacity(capacity)),
            len: AtomicUsize::new(0),
        }
    }

    /// Append to back
    pub fn push(&self, fiber: Box<Fiber>) {
        let mut q = self.tasks.lock();
        q.push_back(fiber);
        self.len.store(q.len(), Ordering::Release);
    }

    /// Pop from front
    pub fn pop(&self) -> Option<Box<Fiber>> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut q = self.tasks.lock();
        let item = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        item
    }

    /// Locked snapshot of the queue length
    pub fn size(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Unlocked length hint (may be stale)
    #[inline]
    pub fn len_hint(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len_hint() == 0
    }

    /// Move `ceil(n/2)` fibers from the front of `self` to the back of `dst`
    ///
    /// A victim holding a single fiber keeps it unless `allow_steal_last` is
    /// set. Returns the number of fibers moved.
    pub fn steal(&self, dst: &RunQueue, allow_steal_last: bool) -> usize {
        if ptr_eq(self, dst) || self.len.load(Ordering::Acquire) == 0 {
            return 0;
        }

        // Lock in address order so two concurrent thieves never deadlock
        let (mut src_q, mut dst_q) = if (self as *const RunQueue) < (dst as *const RunQueue) {
            let s = self.tasks.lock();
            let d = dst.tasks.lock();
            (s, d)
        } else {
            let d = dst.tasks.lock();
            let s = self.tasks.lock();
            (s, d)
        };

        let n = src_q.len();
        if n == 0 || (n == 1 && !allow_steal_last) {
            return 0;
        }
        let k = n.div_ceil(2);
        dst_q.extend(src_q.drain(..k));

        self.len.store(src_q.len(), Ordering::Release);
        dst.len.store(dst_q.len(), Ordering::Release);
        k
    }

    /// Remove every queued fiber
    pub(crate) fn drain(&self) -> Vec<Box<Fiber>> {
        let mut q = self.tasks.lock();
        let all = q.drain(..).collect();
        self.len.store(0, Ordering::Release);
        all
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        for fiber in self.tasks.get_mut().drain(..) {
            Fiber::retire(fiber);
        }
    }
}

#[inline]
fn ptr_eq(a: &RunQueue, b: &RunQueue) -> bool {
    std::ptr::eq(a, b)
}

/// Recycled fibers owned by one processor
///
/// Not shared: only the owning processor thread touches it.
pub struct FreeList {
    fibers: Vec<Box<Fiber>>,
    stack_size: usize,
    max_cached: usize,
}

impl FreeList {
    pub fn new(stack_size: usize, max_cached: usize) -> Self {
        Self {
            fibers: Vec::new(),
            stack_size,
            max_cached,
        }
    }

    /// Reinitialize a cached fiber with `entry`, or allocate a new one
    pub fn build_or_reuse(&mut self, entry: Entry) -> RuntimeResult<Box<Fiber>> {
        match self.fibers.pop() {
            Some(mut fiber) => {
                fiber.reset(entry);
                Ok(fiber)
            }
            None => Fiber::new(entry, self.stack_size),
        }
    }

    /// Cache a terminated fiber; surplus fibers release their stack
    pub fn recycle(&mut self, fiber: Box<Fiber>) {
        if self.fibers.len() < self.max_cached {
            self.fibers.push(fiber);
        }
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }
}
