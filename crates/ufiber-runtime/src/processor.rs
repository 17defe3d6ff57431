//! Processor: one OS thread's scheduling loop
//!
//! A processor owns one io_uring instance and drives the fibers in its local
//! run queue. Each cycle of [`Processor::execute`]:
//!
//! 1. Resume the fibers that were ready at the start of the cycle
//! 2. Submit pending SQEs and wait for completions, bounded by the nearest
//!    timer and `max_event_wait` (no wait at all if work is still queued)
//! 3. Re-enqueue fibers whose operations completed
//! 4. Run expired timer callbacks as fresh fibers
//! 5. With nothing left to do, steal from the global queue or a sibling,
//!    and park if that fails too
//!
//! The ring and the pending-op counter are only ever touched by the owning
//! thread; completions are reaped by the thread that submitted them.

use crate::arch::SavedRegs;
use crate::fiber::{Entry, Fiber};
use crate::hook;
use crate::run_queue::{FreeList, RunQueue};
use crate::runtime::Shared;
use crate::timer::TimerSet;
use crate::tls;
use crate::uring_op;
use io_uring::{squeue, types, IoUring};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use ufiber_core::error::{RuntimeError, RuntimeResult};
use ufiber_core::state::FiberState;
use ufiber_core::{fatal, fatal_assert, kinfo, kprint, kwarn};

/// Per-thread scheduler state
pub struct Processor {
    id: usize,
    shared: Arc<Shared>,
    ring: RefCell<IoUring>,
    pending_ops: Cell<u64>,
    free: RefCell<FreeList>,
    /// Context fibers switch back into
    home: UnsafeCell<SavedRegs>,
}

impl Processor {
    /// Create processor `id` with its own ring
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> RuntimeResult<Self> {
        let config = &shared.config;
        let ring = IoUring::builder()
            .build(config.ring_entries)
            .map_err(RuntimeError::RingSetup)?;
        let free = FreeList::new(config.stack_size, config.free_list_capacity);
        Ok(Self {
            id,
            shared,
            ring: RefCell::new(ring),
            pending_ops: Cell::new(0),
            free: RefCell::new(free),
            home: UnsafeCell::new(SavedRegs::default()),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Operations submitted but not yet reaped
    #[inline]
    pub fn pending_ops(&self) -> u64 {
        self.pending_ops.get()
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    #[inline]
    pub(crate) fn queue(&self) -> &RunQueue {
        self.shared.local_queue(self.id)
    }

    #[inline]
    pub(crate) fn timers(&self) -> &Arc<TimerSet> {
        self.shared.timer_set(self.id)
    }

    /// Build a fiber for `entry`, reusing a terminated one when possible
    pub(crate) fn build_fiber(&self, entry: Entry) -> RuntimeResult<Box<Fiber>> {
        self.free.borrow_mut().build_or_reuse(entry)
    }

    /// Run the scheduling loop on the calling thread until shutdown
    pub fn execute(&self) {
        tls::enter_processor(self, self.home.get());
        kprint::set_processor_context(Some(self.id));
        hook::set_hook_enable(self.shared.config.hook_enabled);
        kinfo!("processor {} started", self.id);

        let park_timeout = self.shared.config.park_timeout;
        while !self.shared.is_shutdown() {
            let has_job = self.exec_once();
            if !self.queue().is_empty() {
                continue;
            }
            if self.shared.steal_tasks(self.id) > 0 {
                continue;
            }
            if !has_job {
                self.shared.parking.park(Some(park_timeout));
            }
        }

        let leaked = self.retire_queued();
        if leaked > 0 || self.pending_ops.get() > 0 {
            kwarn!(
                "processor {} leaking {} queued fibers, {} operations in flight",
                self.id,
                leaked,
                self.pending_ops.get()
            );
        }
        kinfo!("processor {} stopped", self.id);
        hook::set_hook_enable(false);
        tls::leave_processor();
    }

    /// One scheduling cycle; returns false if there was nothing to do
    fn exec_once(&self) -> bool {
        // Snapshot so yielding fibers cannot starve the reactor
        let budget = self.queue().len_hint();
        let mut ran = 0;
        while ran < budget {
            let Some(fiber) = self.queue().pop() else {
                break;
            };
            self.run_fiber(fiber);
            ran += 1;
        }

        let next_timer = self.timers().next_trigger_duration();
        if self.pending_ops.get() == 0 && next_timer.is_none() {
            return ran > 0;
        }

        let max_wait = self.shared.config.max_event_wait;
        let wait = if !self.queue().is_empty() {
            Duration::ZERO
        } else {
            next_timer.map_or(max_wait, |t| t.min(max_wait))
        };
        self.wait_event(wait);
        self.run_expired_timers();
        true
    }

    /// Resume `fiber` and route it by the state it switched out with
    fn run_fiber(&self, fiber: Box<Fiber>) {
        let raw = Box::into_raw(fiber);
        // Safety: `raw` came from a Box we own; nothing else references it
        let state = unsafe { Fiber::resume(raw) };
        match state {
            FiberState::Ready => {
                let fiber = unsafe { Box::from_raw(raw) };
                self.queue().push(fiber);
            }
            FiberState::Term | FiberState::Except => {
                let fiber = unsafe { Box::from_raw(raw) };
                self.shared.record_exit(state);
                self.free.borrow_mut().recycle(fiber);
            }
            // Owned by its in-flight completion until the reactor reaps it
            FiberState::Blocked => {}
            other => fatal!("fiber switched out in state {}", other),
        }
    }

    fn run_expired_timers(&self) {
        for cb in self.timers().expired_callbacks() {
            match self.build_fiber(Box::new(move || cb())) {
                Ok(fiber) => {
                    self.shared.record_spawn();
                    self.run_fiber(fiber);
                }
                Err(e) => kwarn!("processor {}: timer callback dropped: {}", self.id, e),
            }
        }
    }

    /// Reserve SQ space for `entries`, push them and count them as pending
    ///
    /// Entries pushed together are submitted in the same batch, which keeps
    /// `IO_LINK` chains intact.
    pub(crate) fn push_sqes(&self, entries: &[squeue::Entry]) {
        let n = entries.len();
        if let Some(owner) = tls::current_processor() {
            fatal_assert!(
                std::ptr::eq(owner, self),
                "processor {} ring used from processor {}",
                self.id,
                owner.id
            );
        }
        loop {
            let mut ring = self.ring.borrow_mut();
            let (capacity, used) = {
                let sq = ring.submission();
                (sq.capacity(), sq.len())
            };
            fatal_assert!(n <= capacity, "{} SQEs requested from a ring of {}", n, capacity);

            if capacity - used >= n {
                // Safety: every entry's buffers outlive the submitting fiber's
                // suspension, which ends only after their completions
                if unsafe { ring.submission().push_multiple(entries) }.is_err() {
                    fatal!("processor {}: submission queue full after reserve", self.id);
                }
                self.pending_ops.set(self.pending_ops.get() + n as u64);
                return;
            }

            let res = ring.submit();
            drop(ring);
            if let Err(e) = res {
                match e.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => {}
                    // Completion queue is full; make room before retrying
                    Some(libc::EBUSY) => {
                        self.reap();
                    }
                    _ => fatal!("processor {}: io_uring submit failed: {}", self.id, e),
                }
            }
        }
    }

    /// Submit pending SQEs and wait up to `timeout` for at least one completion
    pub(crate) fn wait_event(&self, timeout: Duration) {
        let res = {
            let ring = self.ring.borrow();
            if timeout.is_zero() {
                ring.submit()
            } else {
                let ts = types::Timespec::from(timeout);
                let args = types::SubmitArgs::new().timespec(&ts);
                ring.submitter().submit_with_args(1, &args)
            }
        };
        if let Err(e) = res {
            if !is_transient_wait_error(&e) {
                fatal!("processor {}: io_uring wait failed: {}", self.id, e);
            }
        }
        self.reap();
    }

    /// Drain the completion queue and wake the fibers whose ops finished
    fn reap(&self) -> usize {
        let completions: Vec<(u64, i32)> = {
            let mut ring = self.ring.borrow_mut();
            ring.completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect()
        };
        let n = completions.len();
        self.pending_ops
            .set(self.pending_ops.get().saturating_sub(n as u64));
        for (token, res) in completions {
            self.deliver(token, res);
        }
        n
    }

    fn deliver(&self, token: u64, res: i32) {
        if token == 0 {
            return;
        }
        // Safety: every token we submit is a live OpSlot on a suspended fiber
        if let Some(raw) = unsafe { uring_op::complete(token, res) } {
            let mut fiber = unsafe { Box::from_raw(raw) };
            fiber.mark_ready();
            self.queue().push(fiber);
        }
    }

    /// Drop queued fibers at shutdown; returns how many had to be leaked
    fn retire_queued(&self) -> usize {
        self.queue()
            .drain()
            .into_iter()
            .map(Fiber::retire)
            .filter(|leaked| *leaked)
            .count()
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("pending_ops", &self.pending_ops.get())
            .field("free", &self.free.borrow().len())
            .finish()
    }
}

/// `ETIME` and `EBUSY` mean "reap what is there"; `EINTR` and `EAGAIN` retry
#[inline]
fn is_transient_wait_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_wait_errors() {
        for errno in [libc::ETIME, libc::EINTR, libc::EBUSY, libc::EAGAIN] {
            assert!(is_transient_wait_error(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_transient_wait_error(&io::Error::from_raw_os_error(libc::EBADF)));
    }

    #[test]
    fn test_ops_counted() {
        use crate::config::RuntimeConfig;
        let shared = Shared::new(RuntimeConfig::new().num_processors(1).ring_entries(8));
        let processor = match Processor::new(0, shared) {
            Ok(p) => p,
            // io_uring unavailable (seccomp, old kernel)
            Err(_) => return,
        };
        let nop = io_uring::opcode::Nop::new().build();
        processor.push_sqes(&[nop.clone(), nop]);
        assert_eq!(processor.pending_ops(), 2);

        let mut reaped = 0;
        for _ in 0..100 {
            processor.wait_event(Duration::from_millis(10));
            reaped = 2 - processor.pending_ops();
            if reaped == 2 {
                break;
            }
        }
        assert_eq!(reaped, 2);
    }
}
