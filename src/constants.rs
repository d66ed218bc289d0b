//! Fixed sizing constants for the event loop. These are not configurable
//! because they bound the scratch allocations the loop makes once at
//! `ThreadContext` construction and reuses for the life of the loop.

/// Size of the epoll event buffer, and the maximum number of sockets
/// batched into a single AIO submission.
pub const EVENT_BUFFER_LENGTH: usize = 512;

/// Maximum `iovec`s a single socket may contribute to one AIO read.
pub const IO_VECTORS_PER_AIO_SOCKET: usize = 8;

/// `listen(2)` backlog for accept sockets created by this crate.
pub const LISTEN_BACKLOG: i32 = 128;

/// Alignment, in bytes, applied once to the AIO arena allocation.
pub const MEMORY_ALIGNMENT: usize = 8;

/// Upper bound on consecutive all-`EAGAIN` AIO read retries before the
/// loop aborts with a `NotSupported`-equivalent error, to bound live-lock.
pub const MAX_EAGAIN_COUNT: u32 = 16;

/// Sentinel `zeroCopyThreshold` value meaning "never use MSG_ZEROCOPY".
pub const NO_ZERO_COPY: usize = usize::MAX;
