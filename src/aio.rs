//! The AIO arena: fixed-size contiguous tables for
//! `io_event[]`, `iocb[]`, `iocb*[]`, and an `iovec[]` table sized
//! `EventBufferLength * IoVectorsPerAioSocket`, plus one `aio_context_t`
//! created with capacity `EventBufferLength`. All tables are allocated
//! once at construction and reused for the life of the loop; `IoCb` and
//! `IoEvent` both start with a `u64` field so a plain `Vec` allocation
//! already satisfies the 8-byte alignment spec.md calls for — no extra
//! padding arithmetic is needed in Rust.

use crate::constants::{EVENT_BUFFER_LENGTH, IO_VECTORS_PER_AIO_SOCKET};
use crate::error::{TransportError, TransportResult};
use crate::syscall::{self, AioContextT, IoCb, IoEvent, IOCB_CMD_NOOP};

pub struct AioArena {
    ctx: AioContextT,
    iocbs: Vec<IoCb>,
    iocb_ptrs: Vec<*mut IoCb>,
    iovecs: Vec<libc::iovec>,
    events: Vec<IoEvent>,
}

impl AioArena {
    pub fn new() -> TransportResult<Self> {
        let ctx = syscall::io_setup(EVENT_BUFFER_LENGTH as u32).map_err(|errno| {
            TransportError::AioInvariantViolation(format!(
                "io_setup failed, errno {errno} (kernel AIO unavailable or nr_events exceeded)"
            ))
        })?;

        let mut iocbs = vec![IoCb::default(); EVENT_BUFFER_LENGTH];
        let iocb_ptrs = iocbs.iter_mut().map(|cb| cb as *mut IoCb).collect();

        Ok(Self {
            ctx,
            iocbs,
            iocb_ptrs,
            iovecs: vec![
                libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 };
                EVENT_BUFFER_LENGTH * IO_VECTORS_PER_AIO_SOCKET
            ],
            events: vec![IoEvent::default(); EVENT_BUFFER_LENGTH],
        })
    }

    /// The `iovec` slots reserved for socket index `i` within this batch
    /// (up to `IoVectorsPerAioSocket` each).
    pub fn iovecs_for(&mut self, i: usize) -> &mut [libc::iovec] {
        let start = i * IO_VECTORS_PER_AIO_SOCKET;
        &mut self.iovecs[start..start + IO_VECTORS_PER_AIO_SOCKET]
    }

    pub fn iocb_mut(&mut self, i: usize) -> &mut IoCb {
        &mut self.iocbs[i]
    }

    /// The raw pointer submitted as `iocbpp[i]`. `io_getevents` echoes
    /// this back as `io_event.obj`, so matching against it identifies
    /// which submitted iocb a completion belongs to without assuming
    /// completions arrive in submission order.
    pub fn iocb_ptr(&self, i: usize) -> u64 {
        self.iocb_ptrs[i] as u64
    }

    /// Submits the first `n` entries of the `iocb` table. Per spec.md
    /// §4.5 step 3, a short submission is an invariant violation this
    /// loop does not tolerate.
    pub fn submit(&mut self, n: usize) -> TransportResult<()> {
        let submitted = syscall::io_submit(self.ctx, &self.iocb_ptrs[..n]).map_err(|errno| {
            TransportError::AioInvariantViolation(format!("io_submit failed, errno {errno}"))
        })?;
        if submitted as usize != n {
            return Err(TransportError::AioInvariantViolation(format!(
                "io_submit queued {submitted} of {n} requested iocbs"
            )));
        }
        Ok(())
    }

    /// Blocks for exactly `n` completions, per spec.md §4.5 step 4.
    pub fn get_events(&mut self, n: usize) -> TransportResult<&[IoEvent]> {
        let got = syscall::io_getevents(self.ctx, n as i64, &mut self.events[..n]).map_err(|errno| {
            TransportError::AioInvariantViolation(format!("io_getevents failed, errno {errno}"))
        })?;
        if got as usize != n {
            return Err(TransportError::AioInvariantViolation(format!(
                "io_getevents returned {got} of {n} requested completions"
            )));
        }
        Ok(&self.events[..n])
    }

    /// Compacts `iocbs[..len]` in place, dropping entries whose opcode is
    /// `IOCB_CMD_NOOP` ("done, exclude from next retry" — spec.md §4.5
    /// step 6). Returns the new length. The caller is responsible for
    /// keeping any side tables (e.g. per-socket state) compacted in the
    /// same order.
    pub fn compact_retained(&mut self, len: usize, keep: &[bool]) -> usize {
        debug_assert_eq!(keep.len(), len);
        let mut write = 0;
        for read in 0..len {
            if keep[read] {
                if write != read {
                    self.iocbs[write] = self.iocbs[read];
                }
                write += 1;
            }
        }
        for cb in &mut self.iocbs[write..len] {
            cb.aio_lio_opcode = IOCB_CMD_NOOP;
        }
        write
    }
}

impl Drop for AioArena {
    fn drop(&mut self) {
        syscall::io_destroy(self.ctx).ok();
    }
}

// Safety: the arena is only ever touched from the single loop thread
// that owns it; it crosses threads solely at construction/destruction.
unsafe impl Send for AioArena {}

/// Packs `(received, advanced, iovLength)` into the 64-bit word carried
/// as `iocb.aio_data` and echoed back unchanged in `io_event.data`, per
/// spec.md §4.5 step 2.
pub fn pack_aio_data(received: u32, advanced: u32, iov_len: u32) -> u64 {
    ((received as u64) << 32) | ((advanced as u64 & 0xFF_FFFF) << 8) | (iov_len as u64 & 0xFF)
}

pub fn unpack_aio_data(packed: u64) -> (u32, u32, u32) {
    let received = (packed >> 32) as u32;
    let advanced = ((packed >> 8) & 0xFF_FFFF) as u32;
    let iov_len = (packed & 0xFF) as u32;
    (received, advanced, iov_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aio_data_packing_round_trips() {
        let cases = [
            (0u32, 0u32, 0u32),
            (u32::MAX, 0, 0),
            (0, 0xFF_FFFF, 0),
            (0, 0, 255),
            (123456, 777, 8),
            (4_000_000_000, 16_000_000, 200),
        ];
        for (received, advanced, iov_len) in cases {
            let packed = pack_aio_data(received, advanced, iov_len);
            assert_eq!(unpack_aio_data(packed), (received, advanced, iov_len));
        }
    }

    #[test]
    fn iocb_and_io_event_are_eight_byte_aligned_by_construction() {
        assert_eq!(std::mem::align_of::<IoCb>(), 8);
        assert_eq!(std::mem::align_of::<IoEvent>(), 8);
    }
}
