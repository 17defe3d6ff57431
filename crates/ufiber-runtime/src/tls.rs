//! Thread-local runtime context
//!
//! Provides fast access to the current processor, the fiber it is running,
//! and the processor's home context that fibers switch back into.
//!
//! Contract: a processor thread calls [`enter_processor`] before running any
//! fiber and [`leave_processor`] before its `Processor` is dropped. Between the
//! two calls the registered processor outlives everything executing on the
//! thread, which is what makes handing out `&'static` references sound.

use crate::arch::SavedRegs;
use crate::fiber::Fiber;
use crate::processor::Processor;
use std::cell::Cell;
use std::ptr;
use ufiber_core::id::FiberId;
use ufiber_core::kprint;

thread_local! {
    /// Processor driving this OS thread
    static PROCESSOR: Cell<*const Processor> = const { Cell::new(ptr::null()) };

    /// Fiber currently executing on this thread
    static CURRENT_FIBER: Cell<*mut Fiber> = const { Cell::new(ptr::null_mut()) };

    /// Context a yielding fiber switches back into
    static HOME_CONTEXT: Cell<*mut SavedRegs> = const { Cell::new(ptr::null_mut()) };
}

/// Register the processor (and its home context) for this thread
#[inline]
pub(crate) fn enter_processor(processor: *const Processor, home: *mut SavedRegs) {
    PROCESSOR.with(|cell| cell.set(processor));
    set_home_context(home);
}

/// Clear the processor registration for this thread
#[inline]
pub(crate) fn leave_processor() {
    PROCESSOR.with(|cell| cell.set(ptr::null()));
    set_home_context(ptr::null_mut());
    kprint::set_processor_context(None);
}

/// Get the processor driving this thread, if any
#[inline]
pub(crate) fn current_processor() -> Option<&'static Processor> {
    let p = PROCESSOR.with(|cell| cell.get());
    // Safety: see module contract
    unsafe { p.as_ref() }
}

/// Set the context yielding fibers return to
#[inline]
pub(crate) fn set_home_context(home: *mut SavedRegs) {
    HOME_CONTEXT.with(|cell| cell.set(home));
}

/// Get the context yielding fibers return to
#[inline]
pub(crate) fn home_context() -> *mut SavedRegs {
    HOME_CONTEXT.with(|cell| cell.get())
}

/// Set the fiber running on this thread
#[inline]
pub(crate) fn set_current_fiber(fiber: *mut Fiber, id: FiberId) {
    CURRENT_FIBER.with(|cell| cell.set(fiber));
    kprint::set_fiber_context(id.as_u64());
}

/// Clear the running fiber (back on the home context)
#[inline]
pub(crate) fn clear_current_fiber() {
    CURRENT_FIBER.with(|cell| cell.set(ptr::null_mut()));
    kprint::set_fiber_context(0);
}

/// Raw pointer to the running fiber, null outside fibers
#[inline]
pub(crate) fn current_fiber() -> *mut Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

/// Check if we're running inside a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    !current_fiber().is_null()
}

/// Check if this thread is a processor thread
#[inline]
pub fn is_processor_thread() -> bool {
    PROCESSOR.with(|cell| !cell.get().is_null())
}

/// Id of the running fiber, `FiberId::NONE` outside fibers
#[inline]
pub fn current_fiber_id() -> FiberId {
    let fiber = current_fiber();
    if fiber.is_null() {
        FiberId::NONE
    } else {
        // Safety: the running fiber is alive for as long as it runs
        unsafe { (*fiber).id() }
    }
}

/// Id of the processor driving this thread, if any
#[inline]
pub fn current_processor_id() -> Option<usize> {
    current_processor().map(|p| p.id())
}
