//! Fiber stacks backed by anonymous mmap
//!
//! Layout (low to high address):
//!
//! ```text
//! +------------+------------------------------+
//! | guard page |  usable stack (grows down)   |
//! | PROT_NONE  |  PROT_READ | PROT_WRITE      |
//! +------------+------------------------------+
//! ^ base                                      ^ top
//! ```
//!
//! The mapping is `MAP_NORESERVE`, so physical pages are only committed as
//! the fiber actually touches them.

use std::ptr::NonNull;
use ufiber_core::constants::PAGE_SIZE;
use ufiber_core::error::{RuntimeError, RuntimeResult};

/// An exclusively owned, guard-protected stack
pub struct FiberStack {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is owned exclusively by this value; moving it between
// threads moves that ownership.
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Map a stack with at least `size` usable bytes plus one guard page
    pub fn new(size: usize) -> RuntimeResult<Self> {
        let usable = round_up(size.max(PAGE_SIZE), PAGE_SIZE);
        let len = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackAllocation(last_errno()));
        }

        // Lowest page traps overflow instead of corrupting a neighbour
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let errno = last_errno();
            unsafe { libc::munmap(base, len) };
            return Err(RuntimeError::StackAllocation(errno));
        }

        let base = NonNull::new(base as *mut u8).ok_or(RuntimeError::StackAllocation(libc::ENOMEM))?;
        Ok(Self { base, len })
    }

    /// One-past-the-end address; the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Lowest usable address (just above the guard page)
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(PAGE_SIZE) }
    }

    /// Usable bytes, excluding the guard page
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.len - PAGE_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberStack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .finish()
    }
}

#[inline]
fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[inline]
fn last_errno() -> i32 {
    nix::errno::Errno::last_raw()
}
