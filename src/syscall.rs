//! Thin wrappers around the raw syscalls this loop needs. Every wrapper
//! returns a [`PosixResult`]: the non-negative return value of the
//! underlying call, or the negated `errno`. None of these allocate; they
//! are meant to be called from the hot path without touching the heap.
//!
//! Linux AIO (`io_setup`/`io_submit`/`io_getevents`/`io_destroy`) has no
//! `libc` binding — those syscalls live in `libaio`, not glibc — so this
//! module defines the handful of raw structs needed and issues them via
//! `libc::syscall`.

use std::os::fd::RawFd;

/// Non-negative value on success, or a negative errno on failure. Mirrors
/// the raw convention most of these syscalls use directly, so a caller can
/// propagate the negative value straight into a `std::io::Error`.
pub type PosixResult = Result<i64, i32>;

#[inline]
fn check(ret: i64) -> PosixResult {
    if ret < 0 {
        Err(-(unsafe { *libc::__errno_location() }))
    } else {
        Ok(ret)
    }
}

#[inline]
pub fn errno_to_io_error(errno: i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno)
}

pub fn epoll_create1() -> PosixResult {
    check(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } as i64)
}

pub fn epoll_ctl(epfd: RawFd, op: i32, fd: RawFd, event: &mut libc::epoll_event) -> PosixResult {
    check(unsafe { libc::epoll_ctl(epfd, op, fd, event) } as i64)
}

pub fn epoll_wait(
    epfd: RawFd,
    events: &mut [libc::epoll_event],
    timeout_ms: i32,
) -> PosixResult {
    check(unsafe {
        libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
    } as i64)
}

pub fn pipe2_nonblocking() -> Result<(RawFd, RawFd), i32> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret < 0 {
        Err(unsafe { *libc::__errno_location() })
    } else {
        Ok((fds[0], fds[1]))
    }
}

pub fn read_byte(fd: RawFd, buf: &mut [u8; 1]) -> PosixResult {
    check(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, 1) } as i64)
}

pub fn write_byte(fd: RawFd, byte: u8) -> PosixResult {
    let buf = [byte];
    check(unsafe { libc::write(fd, buf.as_ptr() as *const _, 1) } as i64)
}

pub fn accept4(fd: RawFd) -> PosixResult {
    check(unsafe {
        libc::accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    } as i64)
}

pub fn readv(fd: RawFd, iov: &[libc::iovec]) -> PosixResult {
    check(unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as i32) } as i64)
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> PosixResult {
    check(unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) } as i64)
}

/// `send(2)` with an explicit flag set, used for the `MSG_ZEROCOPY` send
/// path. The completion notification for a
/// zero-copy send arrives later as `EPOLLERR`, handled separately.
pub fn send_with_flags(fd: RawFd, buf: &[u8], flags: i32) -> PosixResult {
    check(unsafe { libc::send(fd, buf.as_ptr() as *const _, buf.len(), flags) } as i64)
}

pub fn close(fd: RawFd) -> PosixResult {
    check(unsafe { libc::close(fd) } as i64)
}

// ===================== Linux AIO (not io_uring) =====================
//
// `aio_context_t` is an opaque kernel handle (just a `u64` to userspace).
// `iocb` and `io_event` layouts below match `linux/aio_abi.h` exactly;
// field order and padding matter because the kernel reads them directly.

pub type AioContextT = u64;

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;
pub const IOCB_CMD_NOOP: u16 = 6;
pub const IOCB_CMD_PREADV: u16 = 7;
pub const IOCB_CMD_PWRITEV: u16 = 8;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoCb {
    pub aio_data: u64,
    pub aio_key_or_rw_flags: u32,
    pub aio_reserved1: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Default for IoCb {
    fn default() -> Self {
        // Safety: an all-zero `IoCb` is a valid representation (opcode 0
        // is `IOCB_CMD_PREAD`, which this crate never submits bare).
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

impl Default for IoEvent {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

fn aio_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn io_setup(nr_events: u32) -> Result<AioContextT, i32> {
    let mut ctx: AioContextT = 0;
    let ret = unsafe { libc::syscall(libc::SYS_io_setup, nr_events as i64, &mut ctx as *mut _) };
    if ret < 0 {
        Err(aio_errno())
    } else {
        Ok(ctx)
    }
}

pub fn io_destroy(ctx: AioContextT) -> PosixResult {
    check(unsafe { libc::syscall(libc::SYS_io_destroy, ctx) })
}

/// Submits `iocbpp[..nr]`. Returns the number of iocbs actually queued, or
/// a negative errno.
pub fn io_submit(ctx: AioContextT, iocbpp: &[*mut IoCb]) -> PosixResult {
    check(unsafe {
        libc::syscall(
            libc::SYS_io_submit,
            ctx,
            iocbpp.len() as i64,
            iocbpp.as_ptr(),
        )
    })
}

/// Blocks until between `min_nr` and `events.len()` completions are ready.
/// Returns the number of events filled in, or a negative errno.
pub fn io_getevents(ctx: AioContextT, min_nr: i64, events: &mut [IoEvent]) -> PosixResult {
    check(unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            min_nr,
            events.len() as i64,
            events.as_mut_ptr(),
            std::ptr::null::<libc::timespec>(),
        )
    })
}

// ===================== MSG_ZEROCOPY completions =====================
//
// A zero-copy send's completion arrives on the socket's error queue
// (`MSG_ERRQUEUE`) as a `sock_extended_err` ancillary message. Origin
// `SO_EE_ORIGIN_ZEROCOPY` with code `SO_EE_CODE_ZEROCOPY_COPIED` means the
// kernel had to fall back to a copy; any other code under that origin
// means the buffer was retired without copying.

pub const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
pub const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroCopyOutcome {
    Success,
    Copied,
}

/// Pure classification of one `sock_extended_err`'s origin/code, kept
/// separate from the actual `recvmsg` call so it can be unit-tested
/// without a live socket error queue.
pub fn classify_zerocopy_completion(origin: u8, code: u8) -> Option<ZeroCopyOutcome> {
    if origin != SO_EE_ORIGIN_ZEROCOPY {
        return None;
    }
    Some(if code == SO_EE_CODE_ZEROCOPY_COPIED {
        ZeroCopyOutcome::Copied
    } else {
        ZeroCopyOutcome::Success
    })
}

#[repr(C)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// Drains one completion from `fd`'s error queue. `Err(EAGAIN)` means no
/// completion is ready yet.
pub fn complete_zero_copy(fd: RawFd) -> Result<ZeroCopyOutcome, i32> {
    let mut buf = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut _,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 128];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cmsg_buf.len();

    let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
    if ret < 0 {
        return Err(unsafe { *libc::__errno_location() });
    }

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };
        if (c.cmsg_level == libc::SOL_IP || c.cmsg_level == libc::SOL_IPV6)
            && unsafe { libc::CMSG_DATA(cmsg) as usize - cmsg as usize }
                <= cmsg_buf.len().saturating_sub(std::mem::size_of::<SockExtendedErr>())
        {
            let data = unsafe { &*(libc::CMSG_DATA(cmsg) as *const SockExtendedErr) };
            if let Some(outcome) = classify_zerocopy_completion(data.ee_origin, data.ee_code) {
                return Ok(outcome);
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }
    Err(libc::EAGAIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_zerocopy_completion_distinguishes_copy_from_success() {
        assert_eq!(
            classify_zerocopy_completion(SO_EE_ORIGIN_ZEROCOPY, SO_EE_CODE_ZEROCOPY_COPIED),
            Some(ZeroCopyOutcome::Copied)
        );
        assert_eq!(
            classify_zerocopy_completion(SO_EE_ORIGIN_ZEROCOPY, 0),
            Some(ZeroCopyOutcome::Success)
        );
        assert_eq!(classify_zerocopy_completion(0, 0), None);
    }

    #[test]
    fn iocb_is_zeroable_and_sized_like_the_kernel_abi() {
        // linux/aio_abi.h: struct iocb is 64 bytes on all supported ABIs.
        assert_eq!(std::mem::size_of::<IoCb>(), 64);
        assert_eq!(std::mem::size_of::<IoEvent>(), 32);
    }

    #[test]
    fn pipe2_nonblocking_round_trips_a_byte() {
        let (r, w) = pipe2_nonblocking().expect("pipe2");
        assert_eq!(write_byte(w, 7), Ok(1));
        let mut buf = [0u8; 1];
        assert_eq!(read_byte(r, &mut buf), Ok(1));
        assert_eq!(buf[0], 7);
        close(r).ok();
        close(w).ok();
    }
}
