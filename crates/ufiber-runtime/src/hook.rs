//! Fiber-aware replacements for blocking POSIX calls
//!
//! Each wrapper has the signature and errno convention of the libc call it
//! stands in for. When hooking is enabled on the calling thread and a fiber
//! is running, the call is issued through io_uring and only the fiber waits;
//! otherwise it goes straight to libc.
//!
//! Hooking is a per-thread flag. Processor threads start with the value of
//! `RuntimeConfig::hook_enabled`; fibers may flip it with [`set_hook_enable`],
//! which affects every fiber on that processor.
//!
//! ```rust,ignore
//! use ufiber_runtime::hook;
//!
//! let n = hook::read(fd, &mut buf);
//! if n < 0 {
//!     eprintln!("read failed: {}", nix::errno::Errno::last());
//! }
//! ```

use crate::tls;
use crate::uring_op::{self, AsyncOp};
use libc::{c_int, c_void, size_t, sockaddr, socklen_t, ssize_t};
use nix::errno::Errno;
use std::cell::Cell;
use std::time::Duration;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Enable or disable hooking for the calling thread
pub fn set_hook_enable(flag: bool) {
    HOOK_ENABLED.with(|cell| cell.set(flag));
}

/// Whether hooking is enabled for the calling thread
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

#[inline]
fn hooked() -> bool {
    is_hook_enable() && tls::is_in_fiber()
}

/// Issue `op` until it is not interrupted; map `-errno` to `errno` + `-1`
fn run_op(mut op: impl FnMut() -> i32) -> i32 {
    loop {
        let res = op();
        if res == -libc::EINTR {
            continue;
        }
        if res < 0 {
            Errno::set_raw(-res);
            return -1;
        }
        return res;
    }
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !hooked() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    run_op(|| AsyncOp::new().prep_socket(domain, ty, protocol).submit_and_park())
}

/// # Safety
///
/// Same contract as `connect(2)`: `addr` must point to `len` readable bytes.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    if !hooked() {
        return libc::connect(fd, addr, len);
    }
    run_op(|| AsyncOp::new().prep_connect(fd, addr, len).submit_and_park())
}

/// # Safety
///
/// Same contract as `accept(2)`: `addr`/`len` are null or writable.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    if !hooked() {
        return libc::accept(fd, addr, len);
    }
    run_op(|| AsyncOp::new().prep_accept(fd, addr, len, 0).submit_and_park())
}

pub fn read(fd: c_int, buf: &mut [u8]) -> ssize_t {
    if !hooked() {
        return unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len() as size_t) };
    }
    run_op(|| AsyncOp::new().prep_read(fd, &mut *buf).submit_and_park()) as ssize_t
}

pub fn write(fd: c_int, buf: &[u8]) -> ssize_t {
    if !hooked() {
        return unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len() as size_t) };
    }
    run_op(|| AsyncOp::new().prep_write(fd, buf).submit_and_park()) as ssize_t
}

pub fn recv(fd: c_int, buf: &mut [u8], flags: c_int) -> ssize_t {
    if !hooked() {
        return unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len() as size_t, flags)
        };
    }
    run_op(|| AsyncOp::new().prep_recv(fd, &mut *buf, flags).submit_and_park()) as ssize_t
}

pub fn send(fd: c_int, buf: &[u8], flags: c_int) -> ssize_t {
    if !hooked() {
        return unsafe {
            libc::send(fd, buf.as_ptr() as *const c_void, buf.len() as size_t, flags)
        };
    }
    run_op(|| AsyncOp::new().prep_send(fd, buf, flags).submit_and_park()) as ssize_t
}

/// # Safety
///
/// Same contract as `recvfrom(2)`: `addr`/`len` are null or writable.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: &mut [u8],
    flags: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
) -> ssize_t {
    if !hooked() {
        return libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len() as size_t,
            flags,
            addr,
            len,
        );
    }
    run_op(|| {
        AsyncOp::new()
            .prep_recvfrom(fd, &mut *buf, flags, addr, len)
            .submit_and_park()
    }) as ssize_t
}

/// # Safety
///
/// Same contract as `sendto(2)`: `addr` is null or points to `len` bytes.
pub unsafe fn sendto(
    fd: c_int,
    buf: &[u8],
    flags: c_int,
    addr: *const sockaddr,
    len: socklen_t,
) -> ssize_t {
    if !hooked() {
        return libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len() as size_t,
            flags,
            addr,
            len,
        );
    }
    run_op(|| {
        AsyncOp::new()
            .prep_sendto(fd, buf, flags, addr, len)
            .submit_and_park()
    }) as ssize_t
}

pub fn close(fd: c_int) -> c_int {
    if !hooked() {
        return unsafe { libc::close(fd) };
    }
    // A retried close could hit a reused descriptor
    let res = AsyncOp::new().prep_close(fd).submit_and_park();
    if res < 0 {
        Errno::set_raw(-res);
        return -1;
    }
    res
}

/// `sleep(3)`; always sleeps the full duration and returns 0 when hooked
pub fn sleep(seconds: u32) -> u32 {
    if !hooked() {
        return unsafe { libc::sleep(seconds) };
    }
    uring_op::sleep(Duration::from_secs(seconds as u64));
    0
}

/// `usleep(3)`
pub fn usleep(usec: u32) -> c_int {
    if !hooked() {
        return unsafe { libc::usleep(usec) };
    }
    uring_op::sleep(Duration::from_micros(usec as u64));
    0
}
