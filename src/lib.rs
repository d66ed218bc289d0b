//! A per-thread TCP transport event loop for Linux: `epoll` multiplexing,
//! `SO_REUSEPORT` fan-out across sibling threads, optional Linux AIO
//! batching for receive/send, and `MSG_ZEROCOPY` completion handling.
//!
//! [`TransportConfig`] configures one loop; [`new_loop`] constructs a
//! [`Transport`] handle (clonable, safe to share with other threads) and
//! an [`EventLoop`] (loop-private, run with [`EventLoop::run`] on its own
//! thread). The per-connection protocol — what to do with received bytes,
//! what to send next — is supplied by implementing [`ConnectionDelegate`].

#[cfg(not(any(
    target_env = "musl",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "windows"
)))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod accept_queue;
mod aio;
mod config;
mod constants;
mod epoll;
mod error;
mod event_loop;
mod gate;
mod memory_pool;
mod pipe;
mod socket;
mod syscall;
mod transports;

pub use config::{ApplicationSchedulingMode, TransportConfig};
pub use error::{TransportError, TransportResult};
pub use event_loop::{new_loop, AcceptSource, EventLoop, LoopState, Transport};
pub use socket::{ConnectionDelegate, EchoDelegate, SocketKind, TSocket};
