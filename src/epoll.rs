//! The loop's single epoll instance and its arming policy.
//!
//! Client sockets are always armed `EPOLLONESHOT` with the bare FD as the
//! epoll key; accept sockets and the wakeup pipe are armed once,
//! level-triggered, and never disarmed until shutdown. All arming for a
//! given client FD must happen under that socket's gate — this module
//! does not itself lock anything, it only issues the `epoll_ctl` calls.

use std::os::fd::RawFd;

use rustc_hash::FxHashSet;

use crate::syscall::{self, PosixResult};

pub const READABLE: u32 = libc::EPOLLIN as u32;
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;
pub const ERRORED: u32 = libc::EPOLLERR as u32;

/// One event returned from `epoll_wait`: an FD plus the raw event mask.
#[derive(Clone, Copy, Debug)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub events: u32,
}

pub struct Epoll {
    epfd: RawFd,
    /// FDs already added via `EPOLL_CTL_ADD`, so a re-arm knows to use
    /// `EPOLL_CTL_MOD` instead.
    registered: FxHashSet<RawFd>,
    raw_events: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new(buffer_len: usize) -> std::io::Result<Self> {
        let epfd = syscall::epoll_create1().map_err(syscall::errno_to_io_error)? as RawFd;
        Ok(Self {
            epfd,
            registered: FxHashSet::default(),
            raw_events: vec![libc::epoll_event { events: 0, u64: 0 }; buffer_len],
        })
    }

    /// Registers `fd` level-triggered, `EPOLLIN` only, and never disarms
    /// it again. Used once at startup for accept sockets and the wakeup
    /// pipe.
    pub fn add_level_triggered_readable(&mut self, fd: RawFd) -> PosixResult {
        let mut event = libc::epoll_event {
            events: READABLE,
            u64: fd as u64,
        };
        let r = syscall::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event);
        if r.is_ok() {
            self.registered.insert(fd);
        }
        r
    }

    /// Arms `fd` with `EPOLLONESHOT | mask`, using `ADD` on first arm and
    /// `MOD` thereafter. `mask` is the intersection of `{EPOLLIN,
    /// EPOLLOUT, EPOLLERR}` the caller currently wants armed.
    pub fn arm_oneshot(&mut self, fd: RawFd, mask: u32) -> PosixResult {
        let mut event = libc::epoll_event {
            events: mask | libc::EPOLLONESHOT as u32,
            u64: fd as u64,
        };
        let op = if self.registered.contains(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let r = syscall::epoll_ctl(self.epfd, op, fd, &mut event);
        if r.is_ok() {
            self.registered.insert(fd);
        }
        r
    }

    /// Removes `fd` from the epoll set. Called before `close(2)` per the
    /// "removal precedes close" invariant.
    pub fn remove(&mut self, fd: RawFd) {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let _ = syscall::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event);
        self.registered.remove(&fd);
    }

    /// Parks in `epoll_wait` with an infinite timeout and returns the ready events from this batch.
    pub fn wait(&mut self) -> PosixResult {
        loop {
            match syscall::epoll_wait(self.epfd, &mut self.raw_events, -1) {
                Err(errno) if errno == libc::EINTR => continue,
                other => return other,
            }
        }
    }

    pub fn ready_events(&self, n: usize) -> impl Iterator<Item = ReadyEvent> + '_ {
        self.raw_events[..n].iter().map(|e| ReadyEvent {
            fd: e.u64 as RawFd,
            events: e.events,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        syscall::close(self.epfd).ok();
    }
}

unsafe impl Send for Epoll {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_oneshot_uses_add_then_mod() {
        let mut epoll = Epoll::new(8).unwrap();
        let (r, w) = syscall::pipe2_nonblocking().unwrap();
        assert!(epoll.arm_oneshot(r, READABLE).is_ok());
        assert!(epoll.registered.contains(&r));
        // Second arm on the same fd must go through MOD, not fail as a
        // duplicate ADD.
        assert!(epoll.arm_oneshot(r, READABLE | WRITABLE).is_ok());
        syscall::close(r).ok();
        syscall::close(w).ok();
    }

    #[test]
    fn level_triggered_add_then_wait_sees_writable_pipe_end() {
        let mut epoll = Epoll::new(8).unwrap();
        let (r, w) = syscall::pipe2_nonblocking().unwrap();
        epoll.add_level_triggered_readable(r).unwrap();
        syscall::write_byte(w, 9).unwrap();
        let n = epoll.wait().unwrap();
        assert_eq!(n, 1);
        let ev: Vec<_> = epoll.ready_events(n as usize).collect();
        assert_eq!(ev[0].fd, r);
        assert_ne!(ev[0].events & READABLE, 0);
        syscall::close(r).ok();
        syscall::close(w).ok();
    }
}
