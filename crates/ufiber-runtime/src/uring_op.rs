//! Fiber-suspending io_uring operations
//!
//! An [`AsyncOp`] couples one io_uring submission to the fiber that built it:
//!
//! ```rust,ignore
//! let n = AsyncOp::new().prep_read(fd, &mut buf).submit_and_park();
//! let n = AsyncOp::with_timeout(Duration::from_millis(100))
//!     .prep_recv(sock, &mut buf, 0)
//!     .submit_and_park();
//! ```
//!
//! Results use the kernel convention: non-negative on success, `-errno` on
//! failure. A timed-out operation returns `-ETIMEDOUT`.
//!
//! Completion plumbing: `user_data` of every SQE is the address of an
//! [`OpSlot`] living on the suspended fiber's stack. The slot records the CQE
//! result and points at a [`Waiter`] that counts the CQEs still outstanding.
//! The processor re-enqueues the fiber when that count reaches zero, so a
//! linked timeout and its target resume the fiber exactly once.

use crate::fiber::{self, Fiber};
use crate::tls;
use io_uring::{opcode, squeue, types};
use std::cell::Cell;
use std::marker::PhantomData;
use std::time::Duration;
use ufiber_core::{fatal, ktrace};

/// Private futex2 flags (u32 futex word, process-private)
pub const FUTEX2_SIZE_U32: u32 = 0x02;
pub const FUTEX2_PRIVATE: u32 = 128;
/// Match any waiter bitset
pub const FUTEX_BITSET_MATCH_ANY: u64 = 0xffff_ffff;

/// File offset meaning "use and advance the current file position"
const CURRENT_POSITION: u64 = u64::MAX;

/// Per-await bookkeeping shared by all SQEs of one logical operation
struct Waiter {
    fiber: *mut Fiber,
    outstanding: Cell<u32>,
}

/// Completion target of one SQE
struct OpSlot {
    waiter: *const Waiter,
    res: Cell<i32>,
}

impl OpSlot {
    fn new(waiter: &Waiter) -> Self {
        Self {
            waiter,
            res: Cell::new(0),
        }
    }

    fn token(&self) -> u64 {
        self as *const OpSlot as u64
    }
}

/// Record a CQE result; returns the fiber once its last CQE has arrived
///
/// # Safety
///
/// `token` must be the `user_data` of an SQE submitted by
/// [`AsyncOp::submit_and_park`] whose completion has not been delivered yet.
pub(crate) unsafe fn complete(token: u64, res: i32) -> Option<*mut Fiber> {
    let slot = &*(token as *const OpSlot);
    slot.res.set(res);
    let waiter = &*slot.waiter;
    let left = waiter.outstanding.get() - 1;
    waiter.outstanding.set(left);
    if left == 0 {
        Some(waiter.fiber)
    } else {
        None
    }
}

/// Storage for msghdr-based operations; boxed so its address survives moves
struct MsgStorage {
    msg: libc::msghdr,
    iov: libc::iovec,
    namelen_out: *mut libc::socklen_t,
}

/// One pending kernel operation of the running fiber
///
/// Must be consumed by [`submit_and_park`](Self::submit_and_park); dropping
/// an unawaited op is a fatal error. Buffers passed to `prep_*` stay
/// borrowed for `'a`, which outlives the suspension.
#[must_use = "an AsyncOp must be awaited with submit_and_park"]
pub struct AsyncOp<'a> {
    fiber: *mut Fiber,
    entry: Option<squeue::Entry>,
    timeout: Option<Duration>,
    timespec: Option<Box<types::Timespec>>,
    msg: Option<Box<MsgStorage>>,
    awaited: bool,
    _buffers: PhantomData<&'a mut [u8]>,
}

impl<'a> AsyncOp<'a> {
    /// Start an operation for the running fiber
    pub fn new() -> Self {
        let fiber = tls::current_fiber();
        if fiber.is_null() || tls::current_processor().is_none() {
            fatal!("AsyncOp created outside a fiber");
        }
        Self::bound(fiber)
    }

    /// Start an operation that is cancelled after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        let mut op = Self::new();
        op.timeout = Some(timeout);
        op
    }

    fn bound(fiber: *mut Fiber) -> Self {
        Self {
            fiber,
            entry: None,
            timeout: None,
            timespec: None,
            msg: None,
            awaited: false,
            _buffers: PhantomData,
        }
    }

    /// Op not tied to any fiber; only its drop check is meaningful
    #[cfg(test)]
    pub(crate) fn unbound() -> Self {
        Self::bound(std::ptr::null_mut())
    }

    fn prep(mut self, entry: squeue::Entry) -> Self {
        if self.entry.is_some() {
            fatal!("AsyncOp prepared twice");
        }
        self.entry = Some(entry);
        self
    }

    /// `openat(2)`; `path` must stay valid until completion
    pub fn prep_openat(self, dirfd: i32, path: &'a std::ffi::CStr, flags: i32, mode: u32) -> Self {
        self.prep(
            opcode::OpenAt::new(types::Fd(dirfd), path.as_ptr())
                .flags(flags)
                .mode(mode)
                .build(),
        )
    }

    /// `socket(2)`
    pub fn prep_socket(self, domain: i32, socket_type: i32, protocol: i32) -> Self {
        self.prep(opcode::Socket::new(domain, socket_type, protocol).build())
    }

    /// `accept4(2)`
    ///
    /// # Safety
    ///
    /// `addr` and `addrlen` must be null or valid for writes until the op
    /// completes.
    pub unsafe fn prep_accept(
        self,
        fd: i32,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: i32,
    ) -> Self {
        self.prep(
            opcode::Accept::new(types::Fd(fd), addr, addrlen)
                .flags(flags)
                .build(),
        )
    }

    /// `connect(2)`
    ///
    /// # Safety
    ///
    /// `addr` must point to `addrlen` readable bytes until the op completes.
    pub unsafe fn prep_connect(
        self,
        fd: i32,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) -> Self {
        self.prep(opcode::Connect::new(types::Fd(fd), addr, addrlen).build())
    }

    /// `read(2)` at the current file position
    pub fn prep_read(self, fd: i32, buf: &'a mut [u8]) -> Self {
        self.prep_read_at(fd, buf, CURRENT_POSITION)
    }

    /// `pread(2)`
    pub fn prep_read_at(self, fd: i32, buf: &'a mut [u8], offset: u64) -> Self {
        self.prep(
            opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), io_len(buf.len()))
                .offset(offset)
                .build(),
        )
    }

    /// `write(2)` at the current file position
    pub fn prep_write(self, fd: i32, buf: &'a [u8]) -> Self {
        self.prep_write_at(fd, buf, CURRENT_POSITION)
    }

    /// `pwrite(2)`
    pub fn prep_write_at(self, fd: i32, buf: &'a [u8], offset: u64) -> Self {
        self.prep(
            opcode::Write::new(types::Fd(fd), buf.as_ptr(), io_len(buf.len()))
                .offset(offset)
                .build(),
        )
    }

    /// `recv(2)`
    pub fn prep_recv(self, fd: i32, buf: &'a mut [u8], flags: i32) -> Self {
        self.prep(
            opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), io_len(buf.len()))
                .flags(flags)
                .build(),
        )
    }

    /// `send(2)`
    pub fn prep_send(self, fd: i32, buf: &'a [u8], flags: i32) -> Self {
        self.prep(
            opcode::Send::new(types::Fd(fd), buf.as_ptr(), io_len(buf.len()))
                .flags(flags)
                .build(),
        )
    }

    /// `recvfrom(2)`, expressed as `recvmsg`
    ///
    /// # Safety
    ///
    /// `addr`/`addrlen` must be null or valid for writes until completion.
    /// On success the kernel's address length is written back to `addrlen`.
    pub unsafe fn prep_recvfrom(
        mut self,
        fd: i32,
        buf: &'a mut [u8],
        flags: i32,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
    ) -> Self {
        let namelen = if addrlen.is_null() { 0 } else { *addrlen };
        let storage = self.msg_storage(buf.as_mut_ptr(), buf.len(), addr.cast(), namelen);
        storage.namelen_out = addrlen;
        let msg = &mut storage.msg as *mut libc::msghdr;
        self.prep(
            opcode::RecvMsg::new(types::Fd(fd), msg)
                .flags(flags as u32)
                .build(),
        )
    }

    /// `sendto(2)`, expressed as `sendmsg`
    ///
    /// # Safety
    ///
    /// `addr` must be null or point to `addrlen` readable bytes until completion.
    pub unsafe fn prep_sendto(
        mut self,
        fd: i32,
        buf: &'a [u8],
        flags: i32,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) -> Self {
        let storage = self.msg_storage(
            buf.as_ptr() as *mut u8,
            buf.len(),
            addr as *mut libc::c_void,
            addrlen,
        );
        let msg = &storage.msg as *const libc::msghdr;
        self.prep(
            opcode::SendMsg::new(types::Fd(fd), msg)
                .flags(flags as u32)
                .build(),
        )
    }

    fn msg_storage(
        &mut self,
        base: *mut u8,
        len: usize,
        name: *mut libc::c_void,
        namelen: libc::socklen_t,
    ) -> &mut MsgStorage {
        // Safety: msghdr and iovec are plain C structs; all-zero is valid
        let mut storage: Box<MsgStorage> = Box::new(unsafe { std::mem::zeroed() });
        storage.iov.iov_base = base.cast();
        storage.iov.iov_len = len;
        storage.msg.msg_iov = &mut storage.iov;
        storage.msg.msg_iovlen = 1;
        storage.msg.msg_name = name;
        storage.msg.msg_namelen = if name.is_null() { 0 } else { namelen };
        self.msg.insert(storage)
    }

    /// `close(2)`
    pub fn prep_close(self, fd: i32) -> Self {
        self.prep(opcode::Close::new(types::Fd(fd)).build())
    }

    /// Wait while the u32 at `futex` equals `expected`
    ///
    /// Returns 0 when woken and `-EAGAIN` if the value already differed.
    pub fn prep_futex_wait(self, futex: &'a std::sync::atomic::AtomicU32, expected: u32) -> Self {
        self.prep(
            opcode::FutexWait::new(
                futex.as_ptr() as *const u32,
                expected as u64,
                FUTEX_BITSET_MATCH_ANY,
                FUTEX2_SIZE_U32 | FUTEX2_PRIVATE,
            )
            .build(),
        )
    }

    /// Wake up to `count` waiters of `futex`; returns the number woken
    pub fn prep_futex_wake(self, futex: &'a std::sync::atomic::AtomicU32, count: u32) -> Self {
        self.prep(
            opcode::FutexWake::new(
                futex.as_ptr() as *const u32,
                count as u64,
                FUTEX_BITSET_MATCH_ANY,
                FUTEX2_SIZE_U32 | FUTEX2_PRIVATE,
            )
            .build(),
        )
    }

    /// Complete after `duration`; the result is `-ETIME` on expiry
    pub fn prep_timeout(mut self, duration: Duration) -> Self {
        let ts: &types::Timespec = self.timespec.insert(Box::new(types::Timespec::from(duration)));
        let entry = opcode::Timeout::new(ts as *const types::Timespec).build();
        self.prep(entry)
    }

    /// No-op round trip through the ring
    pub fn prep_nop(self) -> Self {
        self.prep(opcode::Nop::new().build())
    }

    /// Submit the prepared operation and suspend until it completes
    ///
    /// This is the single terminal call of every `AsyncOp`.
    pub fn submit_and_park(mut self) -> i32 {
        let res = self.park();
        if let Some(storage) = &self.msg {
            if res >= 0 && !storage.namelen_out.is_null() {
                // Safety: validity promised by the prep_recvfrom caller
                unsafe { *storage.namelen_out = storage.msg.msg_namelen };
            }
        }
        res
    }

    fn park(&mut self) -> i32 {
        self.awaited = true;
        let entry = match self.entry.take() {
            Some(entry) => entry,
            None => fatal!("AsyncOp awaited without a prepared operation"),
        };
        if self.fiber.is_null() || tls::current_fiber() != self.fiber {
            fatal!("AsyncOp awaited by a different fiber than the one that created it");
        }
        // The fiber may have been stolen since `new`; the SQE belongs to the
        // ring of the thread running it now
        let processor = match tls::current_processor() {
            Some(p) => p,
            None => fatal!("AsyncOp awaited outside a processor"),
        };

        let waiter = Waiter {
            fiber: self.fiber,
            outstanding: Cell::new(0),
        };
        let main = OpSlot::new(&waiter);

        match self.timeout {
            None => {
                waiter.outstanding.set(1);
                ktrace!("submit op {:#x}", main.token());
                processor.push_sqes(&[entry.user_data(main.token())]);
                fiber::suspend();
                main.res.get()
            }
            Some(timeout) => {
                let ts = types::Timespec::from(timeout);
                let timer = OpSlot::new(&waiter);
                waiter.outstanding.set(2);
                ktrace!("submit op {:#x} with timeout {:?}", main.token(), timeout);
                processor.push_sqes(&[
                    entry
                        .flags(squeue::Flags::IO_LINK)
                        .user_data(main.token()),
                    opcode::LinkTimeout::new(&ts)
                        .build()
                        .user_data(timer.token()),
                ]);
                fiber::suspend();
                resolve_timeout(main.res.get(), timer.res.get())
            }
        }
    }
}

impl Default for AsyncOp<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncOp<'_> {
    fn drop(&mut self) {
        if !self.awaited && !std::thread::panicking() {
            fatal!("AsyncOp dropped without submit_and_park");
        }
    }
}

/// Merge the results of a linked operation and its timeout
fn resolve_timeout(main: i32, timer: i32) -> i32 {
    if timer == -libc::ETIME && (main == -libc::ECANCELED || main == -libc::EINTR) {
        -libc::ETIMEDOUT
    } else {
        main
    }
}

#[inline]
fn io_len(len: usize) -> u32 {
    len.min(u32::MAX as usize) as u32
}

/// Suspend the running fiber for `duration`
///
/// Outside a fiber this sleeps the OS thread.
pub fn sleep(duration: Duration) {
    if !tls::is_in_fiber() {
        std::thread::sleep(duration);
        return;
    }
    let res = AsyncOp::new().prep_timeout(duration).submit_and_park();
    if res < 0 && res != -libc::ETIME {
        ufiber_core::kwarn!("sleep ended early: errno {}", -res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn test_drop_without_await_is_fatal() {
        ufiber_core::kprint::set_log_level(ufiber_core::kprint::LogLevel::Off);
        let op = AsyncOp::unbound().prep_nop();
        drop(op);
    }

    #[test]
    #[should_panic]
    fn test_new_outside_fiber_is_fatal() {
        ufiber_core::kprint::set_log_level(ufiber_core::kprint::LogLevel::Off);
        let op = AsyncOp::new();
        std::mem::forget(op);
    }

    #[test]
    fn test_resolve_timeout() {
        // Timer fired and cancelled the read
        assert_eq!(resolve_timeout(-libc::ECANCELED, -libc::ETIME), -libc::ETIMEDOUT);
        assert_eq!(resolve_timeout(-libc::EINTR, -libc::ETIME), -libc::ETIMEDOUT);
        // Read won the race; the timer was cancelled
        assert_eq!(resolve_timeout(5, -libc::ECANCELED), 5);
        // Completed just as the timer fired
        assert_eq!(resolve_timeout(5, -libc::ETIME), 5);
        assert_eq!(resolve_timeout(-libc::EBADF, -libc::ECANCELED), -libc::EBADF);
    }

    #[test]
    fn test_complete_counts_outstanding() {
        let mut dummy = 0u8;
        let fiber = &mut dummy as *mut u8 as *mut Fiber;
        let waiter = Waiter {
            fiber,
            outstanding: Cell::new(2),
        };
        let main = OpSlot::new(&waiter);
        let timer = OpSlot::new(&waiter);

        assert!(unsafe { complete(timer.token(), -libc::ECANCELED) }.is_none());
        assert_eq!(waiter.outstanding.get(), 1);
        assert_eq!(unsafe { complete(main.token(), 42) }, Some(fiber));
        assert_eq!(main.res.get(), 42);
        assert_eq!(timer.res.get(), -libc::ECANCELED);
    }
}
