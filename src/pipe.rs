//! The in-loop wakeup pipe: a non-blocking pipe pair used by foreign
//! threads to deliver one-byte commands to a parked `epoll_wait`.

use std::os::fd::RawFd;

use crate::syscall::{self, PosixResult};

/// One-byte commands foreign threads can push onto the loop's wakeup pipe.
/// See spec.md §4.7.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopCommand {
    StopThread = 0,
    ActionsPending = 1,
    StopSockets = 2,
    CloseAccept = 3,
}

impl LoopCommand {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(LoopCommand::StopThread),
            1 => Some(LoopCommand::ActionsPending),
            2 => Some(LoopCommand::StopSockets),
            3 => Some(LoopCommand::CloseAccept),
            _ => None,
        }
    }
}

pub struct WakeupPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakeupPipe {
    pub fn new() -> std::io::Result<Self> {
        let (read_fd, write_fd) =
            syscall::pipe2_nonblocking().map_err(syscall::errno_to_io_error)?;
        Ok(Self { read_fd, write_fd })
    }

    #[inline(always)]
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Writes a single command byte. Foreign threads call this; per
    /// spec.md §4.7 and §7, `EPIPE` and "pipe already closed" must be
    /// swallowed silently because the loop may have already shut down.
    pub fn send(&self, cmd: LoopCommand) {
        match syscall::write_byte(self.write_fd, cmd as u8) {
            Ok(_) => {}
            Err(errno) if errno == libc::EPIPE || errno == libc::EBADF => {
                log::debug!("wakeup pipe write dropped, loop already stopped (errno {errno})");
            }
            Err(errno) if errno == libc::EAGAIN => {
                // Pipe full: a command byte is already pending, which is
                // enough to guarantee the loop wakes up and drains it.
            }
            Err(errno) => {
                log::warn!("unexpected error writing to wakeup pipe: errno {errno}");
            }
        }
    }

    /// Drains every pending command byte, invoking `on_command` for each
    /// in FIFO order, matching spec.md §4.1 step 3 ("drain pipe
    /// commands").
    pub fn drain(&self, mut on_command: impl FnMut(LoopCommand)) {
        let mut buf = [0u8; 1];
        loop {
            match syscall::read_byte(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(cmd) = LoopCommand::from_byte(buf[0]) {
                        on_command(cmd);
                    }
                }
                Err(errno) if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK => break,
                Err(errno) => {
                    log::warn!("error reading wakeup pipe: errno {errno}");
                    break;
                }
            }
        }
    }

    fn raw_write_for_test(&self, byte: u8) -> PosixResult {
        syscall::write_byte(self.write_fd, byte)
    }
}

impl Drop for WakeupPipe {
    fn drop(&mut self) {
        syscall::close(self.read_fd).ok();
        syscall::close(self.write_fd).ok();
    }
}

// Safety: raw FDs are plain integers; all mutation goes through syscalls.
unsafe impl Send for WakeupPipe {}
unsafe impl Sync for WakeupPipe {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_commands_in_fifo_order() {
        let pipe = WakeupPipe::new().unwrap();
        pipe.send(LoopCommand::ActionsPending);
        pipe.send(LoopCommand::StopSockets);

        let mut seen = Vec::new();
        pipe.drain(|cmd| seen.push(cmd));
        assert_eq!(seen, vec![LoopCommand::ActionsPending, LoopCommand::StopSockets]);
    }

    #[test]
    fn send_after_close_does_not_panic() {
        let pipe = WakeupPipe::new().unwrap();
        syscall::close(pipe.write_fd).ok();
        // write_fd is now invalid; send() must not panic.
        pipe.send(LoopCommand::StopThread);
    }

    #[test]
    fn unknown_byte_is_ignored() {
        let pipe = WakeupPipe::new().unwrap();
        pipe.raw_write_for_test(0xFF).unwrap();
        let mut seen = Vec::new();
        pipe.drain(|cmd| seen.push(cmd));
        assert!(seen.is_empty());
    }
}
