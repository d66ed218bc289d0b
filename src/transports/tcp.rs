//! Accept-socket setup: binding/listening for a loop's
//! own accept socket, or accepting a descriptor already produced by an
//! external accept thread over `SCM_RIGHTS`.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::TransportConfig;
use crate::constants::LISTEN_BACKLOG;
use crate::error::{TransportError, TransportResult};
use crate::syscall;

/// Creates and binds this loop's own listening socket per spec.md §4.3:
/// `SO_REUSEADDR`, `SO_REUSEPORT` (so peer loops load-balance), optional
/// `SO_INCOMING_CPU`, optional `TCP_DEFER_ACCEPT`, optional
/// `SO_ZEROCOPY`. Returns the bound, listening socket and its resolved
/// local address (meaningful when the configured port was 0).
pub fn create_accept_socket(config: &TransportConfig) -> TransportResult<(Socket, SocketAddr)> {
    let domain = match config.listen_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(TransportError::Io)?;

    socket.set_reuse_address(true).map_err(TransportError::Io)?;
    socket.set_reuse_port(true).map_err(TransportError::Io)?;
    socket.set_nonblocking(true).map_err(TransportError::Io)?;
    if domain == Domain::IPV6 {
        // IPv4-mapped addresses accept on both families.
        socket.set_only_v6(false).map_err(TransportError::Io)?;
    }

    if let Some(cpu_id) = config.cpu_id {
        if config.receive_on_incoming_cpu {
            set_incoming_cpu(socket.as_raw_fd(), cpu_id);
        }
    }

    socket
        .bind(&config.listen_addr.into())
        .map_err(|e| TransportError::from_bind_errno(e.raw_os_error().unwrap_or(0)))?;

    if config.defer_accept {
        set_tcp_defer_accept(socket.as_raw_fd());
    }
    if config.zero_copy {
        set_zero_copy(socket.as_raw_fd());
    }

    socket.listen(LISTEN_BACKLOG).map_err(TransportError::Io)?;

    let local_addr = socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or(config.listen_addr);

    Ok((socket, local_addr))
}

fn set_incoming_cpu(fd: RawFd, cpu_id: usize) {
    set_int_sockopt(fd, libc::SOL_SOCKET, libc::SO_INCOMING_CPU, cpu_id as i32);
}

fn set_tcp_defer_accept(fd: RawFd) {
    set_int_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1);
}

fn set_zero_copy(fd: RawFd) {
    // SO_ZEROCOPY is not exposed by `libc` on every target; the numeric
    // value is stable ABI (linux/socket.h) across all architectures this
    // crate supports.
    const SO_ZEROCOPY: i32 = 60;
    set_int_sockopt(fd, libc::SOL_SOCKET, SO_ZEROCOPY, 1);
}

fn set_int_sockopt(fd: RawFd, level: i32, name: i32, value: i32) {
    unsafe {
        let ret = libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
        if ret != 0 {
            log::warn!(
                "setsockopt(level={level}, name={name}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// `accept4(SOCK_NONBLOCK|SOCK_CLOEXEC)` on the loop's own accept socket
///. Returns the new client FD, or `None` on `EAGAIN`
/// (another loop in the `SO_REUSEPORT` group won the race).
pub fn accept_one(accept_fd: RawFd) -> TransportResult<Option<RawFd>> {
    match syscall::accept4(accept_fd) {
        Ok(fd) => Ok(Some(fd as RawFd)),
        Err(errno) if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => Ok(None),
        Err(errno) => Err(TransportError::Io(syscall::errno_to_io_error(errno))),
    }
}

/// Applies `TCP_NODELAY=1` to a freshly accepted client socket.
pub fn apply_client_socket_options(fd: RawFd) {
    set_int_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
}

pub fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    // Safety: `fd` is a live, owned socket for the duration of this call;
    // the temporary `Socket` is forgotten afterwards so it does not
    // double-close the descriptor.
    let socket = unsafe { Socket::from_raw_fd(fd) };
    let addr = socket.local_addr().ok().and_then(|a| a.as_socket());
    let _ = socket.into_raw_fd();
    addr
}

pub fn peer_addr(fd: RawFd) -> Option<SocketAddr> {
    let socket = unsafe { Socket::from_raw_fd(fd) };
    let addr = socket.peer_addr().ok().and_then(|a| a.as_socket());
    let _ = socket.into_raw_fd();
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    #[test]
    fn create_accept_socket_binds_ephemeral_port() {
        let config = TransportConfig::new("127.0.0.1:0".parse().unwrap());
        let (socket, addr) = create_accept_socket(&config).unwrap();
        assert_ne!(addr.port(), 0);
        drop(socket);
    }

    #[test]
    fn bind_conflict_maps_to_address_in_use() {
        let config = TransportConfig::new("127.0.0.1:0".parse().unwrap());
        let (first, addr) = create_accept_socket(&config).unwrap();

        let mut second_config = TransportConfig::new(addr);
        second_config.listen_addr = addr;
        // A second socket without SO_REUSEPORT semantics conflicting on
        // an already-listening port: simulate by binding a UDP-style
        // exclusive probe is unnecessary here, since SO_REUSEPORT always
        // allows a second bind; instead verify the mapping function
        // directly.
        assert!(matches!(
            TransportError::from_bind_errno(libc::EADDRINUSE),
            TransportError::AddressInUse
        ));
        drop(first);
    }
}
