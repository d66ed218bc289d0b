//! The connection record and the narrow
//! `ConnectionDelegate` seam that stands in for "the per-connection
//! send/receive state machine beyond the operations this loop invokes on
//! it", which is explicitly out of scope for this crate.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::constants::NO_ZERO_COPY;
use crate::epoll::{ERRORED, READABLE, WRITABLE};
use crate::syscall;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    Accept,
    PassFd,
    Client,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SocketFlags: u8 {
        const DEFER_SEND   = 0b001;
        const DEFER_ACCEPT = 0b010;
        const PASS_FD      = 0b100;
    }
}

bitflags::bitflags! {
    /// `pendingEventState`: the raw interest bits plus the internal
    /// "a re-arm is in flight" bit.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PendingEvents: u32 {
        const READABLE             = READABLE;
        const WRITABLE              = WRITABLE;
        const ERRORED               = ERRORED;
        const EVENT_CONTROL_PENDING = 0x8000_0000;
    }
}

/// The mutable state protected by a socket's gate.
#[derive(Default)]
pub struct SocketGate {
    pub pending: PendingEvents,
}

/// What a caller wants to do with the bytes/completions this loop hands
/// it. A real hosting framework supplies its own implementation that
/// parses a wire protocol; [`EchoDelegate`] in the test suite just
/// records what it saw.
pub trait ConnectionDelegate: Send {
    fn on_start(&mut self, data_may_be_available: bool) {
        let _ = data_may_be_available;
    }
    /// Bytes observed by a successful read (sync or AIO path).
    fn on_received(&mut self, data: &[u8]) {
        let _ = data;
    }
    /// The read side reported EOF or an error; `None` means EOF.
    fn on_receive_error(&mut self, _err: Option<i32>) {}
    /// The next chunk queued for output, if any. `None` means there is currently nothing to send.
    fn next_outbound(&mut self) -> Option<Vec<u8>> {
        None
    }
    fn on_send_complete(&mut self, _bytes: usize) {}
    fn on_send_error(&mut self, _err: i32) {}
    /// A partial write left `remainder` unsent; push it back to the
    /// front of the outbound queue so the next scheduled send picks up
    /// where this one left off.
    fn requeue_outbound(&mut self, remainder: Vec<u8>) {
        let _ = remainder;
    }
    fn on_zero_copy_completed(&mut self) {}
    fn on_abort(&mut self) {}
}

/// A delegate that buffers everything it receives, for assertions in
/// tests.
#[derive(Default)]
pub struct EchoDelegate {
    pub received: Vec<u8>,
    pub outbound: VecDeque<Vec<u8>>,
    pub aborted: bool,
    pub zero_copy_completions: usize,
}

impl ConnectionDelegate for EchoDelegate {
    fn on_received(&mut self, data: &[u8]) {
        self.received.extend_from_slice(data);
        self.outbound.push_back(data.to_vec());
    }

    fn next_outbound(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    fn requeue_outbound(&mut self, remainder: Vec<u8>) {
        self.outbound.push_front(remainder);
    }

    fn on_zero_copy_completed(&mut self) {
        self.zero_copy_completions += 1;
    }

    fn on_abort(&mut self) {
        self.aborted = true;
    }
}

pub struct TSocket {
    fd: RawFd,
    kind: SocketKind,
    flags: SocketFlags,
    gate: Mutex<SocketGate>,
    zero_copy_threshold: AtomicUsize,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    delegate: Mutex<Box<dyn ConnectionDelegate>>,
}

impl TSocket {
    pub fn new(
        fd: RawFd,
        kind: SocketKind,
        flags: SocketFlags,
        zero_copy_threshold: usize,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        delegate: Box<dyn ConnectionDelegate>,
    ) -> Self {
        Self {
            fd,
            kind,
            flags,
            gate: Mutex::new(SocketGate::default()),
            zero_copy_threshold: AtomicUsize::new(zero_copy_threshold),
            local_addr,
            peer_addr,
            delegate: Mutex::new(delegate),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    #[inline]
    pub fn flags(&self) -> SocketFlags {
        self.flags
    }

    #[inline]
    pub fn gate(&self) -> &Mutex<SocketGate> {
        &self.gate
    }

    #[inline]
    pub fn zero_copy_threshold(&self) -> usize {
        self.zero_copy_threshold.load(Ordering::Acquire)
    }

    /// Permanently disables zero-copy on this socket.
    pub fn disable_zero_copy(&self) {
        self.zero_copy_threshold.store(NO_ZERO_COPY, Ordering::Release);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Adds `want` to the pending mask, returning the mask that should be
    /// armed on epoll right now (the full pending set, minus the control
    /// bit). Called from any thread that learns this socket wants more
    /// events (e.g. the delegate queued outbound data).
    pub fn request_events(&self, want: PendingEvents) -> PendingEvents {
        let mut gate = self.gate.lock();
        gate.pending |= want;
        gate.pending & (PendingEvents::READABLE | PendingEvents::WRITABLE | PendingEvents::ERRORED)
    }

    pub fn start(&self, data_may_be_available: bool) {
        self.delegate.lock().on_start(data_may_be_available);
    }

    /// Synchronous receive path: one
    /// `readv` into a single pool segment.
    pub fn receive_sync(&self, buf: &mut [u8]) -> Result<usize, i32> {
        match syscall::readv(
            self.fd,
            &[libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut _,
                iov_len: buf.len(),
            }],
        ) {
            Ok(n) => {
                let n = n as usize;
                if n == 0 {
                    self.delegate.lock().on_receive_error(None);
                } else {
                    self.delegate.lock().on_received(&buf[..n]);
                }
                Ok(n)
            }
            Err(errno) if errno == libc::EAGAIN => Ok(0),
            Err(errno) => {
                self.delegate.lock().on_receive_error(Some(errno));
                Err(errno)
            }
        }
    }

    /// How many `iovec`s (up to `max_iov`) this socket wants for one AIO
    /// read batch. This socket always wants
    /// exactly one segment per read; a delegate with a more elaborate
    /// buffering strategy could want more.
    pub fn determine_memory_allocation_for_receive(&self, max_iov: usize) -> usize {
        max_iov.min(1)
    }

    /// Fills `iovecs[..count]` from freshly acquired pool segments,
    /// pushing the handles into `handles` so they can be released after
    /// the batch. Returns `advanced`: bytes already pre-consumed (this
    /// socket never peeks ahead, so always 0).
    pub fn fill_receive_iovec(
        &self,
        pool: &crate::memory_pool::BufferPool,
        iovecs: &mut [libc::iovec],
        handles: &mut Vec<crate::memory_pool::BufferHandle>,
    ) -> u32 {
        let count = self.determine_memory_allocation_for_receive(iovecs.len());
        for slot in iovecs.iter_mut().take(count) {
            let mut handle = pool.acquire();
            *slot = libc::iovec {
                iov_base: handle.as_mut_ptr() as *mut _,
                iov_len: handle.len(),
            };
            handles.push(handle);
        }
        for slot in iovecs.iter_mut().skip(count) {
            *slot = libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            };
        }
        0
    }

    /// Interprets one AIO read completion. `advanced` is the value
    /// `fill_receive_iovec` returned for this socket when the batch was
    /// built: bytes already pre-consumed (e.g. via a `recvmsg` peek)
    /// before the iovecs were populated, and so already visible to the
    /// delegate — they are skipped when delivering `iovecs`. Returns
    /// `(done, retval)`: `done` is false exactly when the kernel reported
    /// `EAGAIN` and no bytes were transferred, meaning this socket must be
    /// retried in the next submission.
    pub fn interpret_receive_result(
        &self,
        res: i64,
        received: &mut u64,
        advanced: u32,
        iovecs: &[libc::iovec],
    ) -> (bool, i64) {
        if res == -(libc::EAGAIN as i64) {
            return (false, res);
        }
        if res < 0 {
            self.delegate.lock().on_receive_error(Some(-(res as i32)));
            return (true, res);
        }
        *received += res as u64;
        let mut remaining = res as usize;
        let mut skip = advanced as usize;
        let mut delegate = self.delegate.lock();
        if res == 0 {
            delegate.on_receive_error(None);
        }
        for iov in iovecs {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(iov.iov_len);
            let mut slice = unsafe { std::slice::from_raw_parts(iov.iov_base as *const u8, take) };
            if skip > 0 {
                let drop_n = skip.min(slice.len());
                slice = &slice[drop_n..];
                skip -= drop_n;
            }
            if !slice.is_empty() {
                delegate.on_received(slice);
            }
            remaining -= take;
        }
        (true, res)
    }

    pub fn on_receive_from_socket(&self, result: i64) {
        if result < 0 {
            self.delegate.lock().on_receive_error(Some(-(result as i32)));
        }
    }

    pub fn on_received_bytes(&self, data: &[u8]) {
        self.delegate.lock().on_received(data);
    }

    /// Pulls the next queued outbound chunk, if any.
    pub fn get_read_result(&self) -> Option<Vec<u8>> {
        self.delegate.lock().next_outbound()
    }

    pub fn on_writable(&self, stopped: bool) {
        if stopped {
            self.delegate.lock().on_abort();
        }
    }

    /// Records completion of a send. Returns `true` when a partial write
    /// left residual bytes requeued onto the delegate's outbound side,
    /// meaning the caller must schedule this socket for another send pass
    /// rather than assume the delegate's queue is now empty.
    pub fn handle_send_result(&self, buf: &[u8], result: i64) -> bool {
        let mut delegate = self.delegate.lock();
        if result < 0 {
            delegate.on_send_error(-(result as i32));
            return false;
        }
        delegate.on_send_complete(result as usize);
        if (result as usize) < buf.len() {
            // Partial write: remaining bytes are re-queued by pushing
            // them back onto the delegate's outbound side for the next
            // scheduled send, preserving per-socket FIFO order.
            let remainder = buf[result as usize..].to_vec();
            delegate.requeue_outbound(remainder);
            true
        } else {
            false
        }
    }

    /// Synchronous deferred send: drains whatever the delegate currently
    /// has queued via plain `write`/`send`. Returns `(bytes_sent,
    /// needs_resend)`, or `None` if nothing was queued; `needs_resend`
    /// tells the caller this socket must be scheduled for another send
    /// pass (a partial write, or nothing went out because of `EAGAIN`).
    pub fn do_deferred_send(&self) -> Option<(i64, bool)> {
        let chunk = self.get_read_result()?;
        if chunk.is_empty() {
            return Some((0, false));
        }
        let use_zero_copy = chunk.len() >= self.zero_copy_threshold();
        let flags = if use_zero_copy { libc::MSG_ZEROCOPY } else { 0 };
        let result = syscall::send_with_flags(self.fd, &chunk, flags);
        match result {
            Ok(n) => {
                let needs_resend = self.handle_send_result(&chunk, n);
                Some((n, needs_resend))
            }
            Err(errno) if errno == libc::EAGAIN => {
                self.delegate.lock().requeue_outbound(chunk);
                Some((0, true))
            }
            Err(errno) => {
                self.handle_send_result(&chunk, -(errno as i64));
                None
            }
        }
    }

    /// How many `iovec`s an AIO send for `buf` needs. This socket always sends a chunk as
    /// one contiguous `iovec`.
    pub fn calc_iovec_length_for_send(&self, _buf: &[u8]) -> usize {
        1
    }

    pub fn fill_send_iovec(&self, iovecs: &mut [libc::iovec], buf: &[u8]) {
        if let Some(slot) = iovecs.first_mut() {
            *slot = libc::iovec {
                iov_base: buf.as_ptr() as *mut _,
                iov_len: buf.len(),
            };
        }
    }

    pub fn complete_output(&self, error: Option<i32>) {
        if let Some(errno) = error {
            self.delegate.lock().on_send_error(errno);
        }
    }

    /// Drains one zero-copy completion. `Ok(true)` means a
    /// buffer was retired without a copy (`ZeroCopySuccess`), `Ok(false)`
    /// means the kernel copied, after which zero-copy is permanently
    /// disabled on this socket. `Err(EAGAIN)` means no completion is
    /// ready yet; any other error is loop-fatal per spec.md §4.4/§7.
    pub fn complete_zero_copy(&self) -> Result<bool, i32> {
        match syscall::complete_zero_copy(self.fd) {
            Ok(syscall::ZeroCopyOutcome::Success) => Ok(true),
            Ok(syscall::ZeroCopyOutcome::Copied) => {
                self.disable_zero_copy();
                Ok(false)
            }
            Err(errno) => Err(errno),
        }
    }

    pub fn on_zero_copy_completed(&self) {
        self.delegate.lock().on_zero_copy_completed();
    }

    pub fn abort(&self) {
        self.delegate.lock().on_abort();
    }

    pub fn close(&self) {
        syscall::close(self.fd).ok();
    }
}

impl std::fmt::Debug for TSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TSocket")
            .field("fd", &self.fd)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_socket() -> TSocket {
        TSocket::new(
            -1,
            SocketKind::Client,
            SocketFlags::empty(),
            NO_ZERO_COPY,
            None,
            None,
            Box::new(EchoDelegate::default()),
        )
    }

    #[test]
    fn request_events_accumulates_under_the_gate() {
        let sock = test_socket();
        let mask = sock.request_events(PendingEvents::READABLE);
        assert!(mask.contains(PendingEvents::READABLE));
        let mask = sock.request_events(PendingEvents::WRITABLE);
        assert!(mask.contains(PendingEvents::READABLE | PendingEvents::WRITABLE));
    }

    #[test]
    fn disable_zero_copy_sets_sentinel() {
        let sock = TSocket::new(
            -1,
            SocketKind::Client,
            SocketFlags::empty(),
            1024,
            None,
            None,
            Box::new(EchoDelegate::default()),
        );
        assert_eq!(sock.zero_copy_threshold(), 1024);
        sock.disable_zero_copy();
        assert_eq!(sock.zero_copy_threshold(), NO_ZERO_COPY);
    }
}
