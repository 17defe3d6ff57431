//! Stackful fibers
//!
//! A [`Fiber`] owns its stack, its saved register file and a one-shot entry
//! function. Processors drive fibers with [`Fiber::resume`]; a running fiber
//! gives control back with [`yield_now`] (stays runnable) or [`suspend`]
//! (parked until its kernel completions are reaped).
//!
//! Panics in the entry function are caught on the fiber's own stack and turn
//! the fiber into `Except`; they never unwind across a context switch.

use crate::arch::{self, SavedRegs};
use crate::stack::FiberStack;
use crate::tls;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use ufiber_core::error::RuntimeResult;
use ufiber_core::fatal::{panic_message, InvariantViolation};
use ufiber_core::id::FiberId;
use ufiber_core::state::{FiberExit, FiberState};
use ufiber_core::{fatal, fatal_assert, kerror, ktrace};

/// Boxed entry function of a fiber
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// A suspendable execution context with its own stack
pub struct Fiber {
    id: FiberId,
    state: FiberState,
    entry: Option<Entry>,
    exit: Option<FiberExit>,
    regs: SavedRegs,
    stack: FiberStack,
}

impl Fiber {
    /// Allocate a stack and prepare a context that runs `entry` on first resume
    pub fn new(entry: Entry, stack_size: usize) -> RuntimeResult<Box<Fiber>> {
        let stack = FiberStack::new(stack_size)?;
        let mut fiber = Box::new(Fiber {
            id: FiberId::next(),
            state: FiberState::Init,
            entry: Some(entry),
            exit: None,
            regs: SavedRegs::default(),
            stack,
        });
        fiber.prepare();
        Ok(fiber)
    }

    /// Reinitialize a finished fiber with a new entry function, reusing its stack
    pub fn reset(&mut self, entry: Entry) {
        fatal_assert!(
            self.state.is_disposable(),
            "fiber {} reset in state {}",
            self.id,
            self.state
        );
        self.id = FiberId::next();
        self.state = FiberState::Init;
        self.entry = Some(entry);
        self.exit = None;
        self.prepare();
    }

    fn prepare(&mut self) {
        // The Box keeps this address stable for the fiber's whole life
        let arg = self as *mut Fiber as usize;
        unsafe { arch::init_context(&mut self.regs, self.stack.top(), fiber_main, arg) };
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state
    }

    /// How the entry function ended, once terminated
    #[inline]
    pub fn exit(&self) -> Option<&FiberExit> {
        self.exit.as_ref()
    }

    #[inline]
    pub(crate) fn mark_ready(&mut self) {
        fatal_assert!(
            self.state == FiberState::Blocked,
            "fiber {} woken in state {}",
            self.id,
            self.state
        );
        self.state = FiberState::Ready;
    }

    /// Switch from the thread's home context into `fiber`
    ///
    /// Returns the state the fiber recorded when it switched back out.
    ///
    /// # Safety
    ///
    /// `fiber` must be valid and exclusively owned by the caller for the
    /// duration of the call, and a home context must be registered for this
    /// thread (see [`tls`]).
    pub(crate) unsafe fn resume(fiber: *mut Fiber) -> FiberState {
        let id = (*fiber).id;
        let state = (*fiber).state;
        fatal_assert!(state.is_resumable(), "fiber {} resumed in state {}", id, state);
        let home = tls::home_context();
        fatal_assert!(!home.is_null(), "fiber {} resumed without a home context", id);

        (*fiber).state = FiberState::Exec;
        tls::set_current_fiber(fiber, id);
        arch::context_switch(home, ptr::addr_of!((*fiber).regs));
        tls::clear_current_fiber();
        (*fiber).state
    }

    /// Dispose of a fiber at shutdown
    ///
    /// Fibers with live frames are leaked rather than unmapped: a kernel
    /// operation may still target their stack. Returns true if leaked.
    pub(crate) fn retire(fiber: Box<Fiber>) -> bool {
        if fiber.state.is_disposable() {
            drop(fiber);
            false
        } else {
            std::mem::forget(fiber);
            true
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if !self.state.is_disposable() && !std::thread::panicking() {
            fatal!("fiber {} destroyed in state {}", self.id, self.state);
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("stack", &self.stack)
            .finish()
    }
}

/// Record `state` for the running fiber and switch to the home context
fn switch_out(state: FiberState) {
    let fiber = tls::current_fiber();
    fatal_assert!(!fiber.is_null(), "fiber switch requested outside a fiber");
    unsafe {
        let current = (*fiber).state;
        fatal_assert!(
            current == FiberState::Exec,
            "fiber {} switched out in state {}",
            (*fiber).id,
            current
        );
        (*fiber).state = state;
        let home = tls::home_context();
        arch::context_switch(ptr::addr_of_mut!((*fiber).regs), home);
    }
}

/// Give up the processor, staying runnable
///
/// Outside a fiber this yields the OS thread instead.
pub fn yield_now() {
    if !tls::is_in_fiber() {
        std::thread::yield_now();
        return;
    }
    switch_out(FiberState::Ready);
}

/// Park the running fiber until its processor re-enqueues it
pub(crate) fn suspend() {
    switch_out(FiberState::Blocked);
}

extern "C" fn fiber_main(arg: usize) -> ! {
    let fiber = arg as *mut Fiber;
    let exit = run_entry(fiber);
    let state = exit.state();
    unsafe { (*fiber).exit = Some(exit) };
    switch_out(state);
    // Terminated fibers are never resumed
    std::process::abort()
}

fn run_entry(fiber: *mut Fiber) -> FiberExit {
    let (id, entry) = unsafe { ((*fiber).id, (*fiber).entry.take()) };
    ktrace!("fiber {} started", id);
    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        if let Some(entry) = entry {
            entry();
        }
    }));
    match result {
        Ok(()) => FiberExit::Completed,
        Err(payload) => {
            let reason = panic_message(&*payload);
            if payload.is::<InvariantViolation>() {
                kerror!("fiber {} hit a fatal invariant violation, aborting", id);
                std::process::abort();
            }
            kerror!("fiber {} failed: {}", id, reason);
            FiberExit::Failed(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TEST_STACK: usize = 256 * 1024;

    fn with_home<R>(f: impl FnOnce() -> R) -> R {
        let mut home = SavedRegs::default();
        tls::set_home_context(&mut home);
        let r = f();
        tls::set_home_context(ptr::null_mut());
        r
    }

    #[test]
    fn test_run_to_completion() {
        with_home(|| {
            let hits = Arc::new(AtomicUsize::new(0));
            let h = hits.clone();
            let mut fiber = Fiber::new(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }), TEST_STACK)
            .unwrap();
            assert_eq!(fiber.state(), FiberState::Init);

            let raw: *mut Fiber = &mut *fiber;
            let state = unsafe { Fiber::resume(raw) };
            assert_eq!(state, FiberState::Term);
            assert_eq!(fiber.exit(), Some(&FiberExit::Completed));
            assert_eq!(hits.load(Ordering::SeqCst), 1);
            assert!(!tls::is_in_fiber());
        });
    }

    #[test]
    fn test_yield_and_resume() {
        with_home(|| {
            let steps = Arc::new(AtomicUsize::new(0));
            let s = steps.clone();
            let mut fiber = Fiber::new(Box::new(move || {
                assert!(tls::is_in_fiber());
                yield_now();
                s.fetch_add(1, Ordering::SeqCst);
                yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            }), TEST_STACK)
            .unwrap();
            let raw: *mut Fiber = &mut *fiber;

            assert_eq!(unsafe { Fiber::resume(raw) }, FiberState::Ready);
            assert_eq!(steps.load(Ordering::SeqCst), 0);
            assert_eq!(unsafe { Fiber::resume(raw) }, FiberState::Ready);
            assert_eq!(steps.load(Ordering::SeqCst), 1);
            assert_eq!(unsafe { Fiber::resume(raw) }, FiberState::Term);
            assert_eq!(steps.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn test_panic_becomes_except() {
        ufiber_core::kprint::set_log_level(ufiber_core::kprint::LogLevel::Off);
        with_home(|| {
            let mut fiber = Fiber::new(Box::new(|| panic!("boom")), TEST_STACK).unwrap();
            let raw: *mut Fiber = &mut *fiber;
            assert_eq!(unsafe { Fiber::resume(raw) }, FiberState::Except);
            assert_eq!(fiber.exit(), Some(&FiberExit::Failed("boom".into())));
        });
    }

    #[test]
    fn test_reset_reuses_stack() {
        with_home(|| {
            let mut fiber = Fiber::new(Box::new(|| {}), TEST_STACK).unwrap();
            let raw: *mut Fiber = &mut *fiber;
            unsafe { Fiber::resume(raw) };
            let old_id = fiber.id();
            let old_top = fiber.stack.top();

            let hits = Arc::new(AtomicUsize::new(0));
            let h = hits.clone();
            fiber.reset(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
            assert_eq!(fiber.state(), FiberState::Init);
            assert!(fiber.exit().is_none());
            assert_ne!(fiber.id(), old_id);
            assert_eq!(fiber.stack.top(), old_top);

            assert_eq!(unsafe { Fiber::resume(raw) }, FiberState::Term);
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_resume_terminated_is_fatal() {
        ufiber_core::kprint::set_log_level(ufiber_core::kprint::LogLevel::Off);
        with_home(|| {
            let mut fiber = Fiber::new(Box::new(|| {}), TEST_STACK).unwrap();
            let raw: *mut Fiber = &mut *fiber;
            unsafe { Fiber::resume(raw) };
            let err = panic::catch_unwind(AssertUnwindSafe(|| unsafe { Fiber::resume(raw) }))
                .unwrap_err();
            assert!(err.is::<InvariantViolation>());
        });
    }

    #[test]
    fn test_yield_outside_fiber() {
        yield_now();
        assert!(!tls::is_in_fiber());
    }

    #[test]
    fn test_retire_leaks_live_fibers() {
        let fiber = Fiber::new(Box::new(|| {}), TEST_STACK).unwrap();
        assert!(!Fiber::retire(fiber));

        let mut fiber = Fiber::new(Box::new(|| {}), TEST_STACK).unwrap();
        fiber.state = FiberState::Ready;
        assert!(Fiber::retire(fiber));
    }
}
