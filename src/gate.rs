//! The scheduling gate: the cross-thread
//! hand-off that lets any thread request a send without ever blocking on
//! the loop, and the "one wakeup byte per parked interval" guarantee that
//! falls out of pairing the gate with an atomic `epollState`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pipe::{LoopCommand, WakeupPipe};
use crate::socket::TSocket;

const BLOCKED: u8 = 0;
const NOT_BLOCKED: u8 = 1;

/// Mirrors spec.md §3's `epollState ∈ {Blocked, NotBlocked}`: whether the
/// loop is (or is about to be) parked in `epoll_wait`.
pub struct EpollState(AtomicU8);

impl EpollState {
    pub fn new() -> Self {
        Self(AtomicU8::new(NOT_BLOCKED))
    }

    pub fn mark_blocked(&self) {
        self.0.store(BLOCKED, Ordering::Release);
    }

    pub fn mark_not_blocked(&self) {
        self.0.store(NOT_BLOCKED, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.0.load(Ordering::Acquire) == BLOCKED
    }

    /// Atomically transitions to `NotBlocked`, returning whether the
    /// previous state was `Blocked`.
    fn cas_to_not_blocked(&self) -> bool {
        self.0.swap(NOT_BLOCKED, Ordering::AcqRel) == BLOCKED
    }
}

impl Default for EpollState {
    fn default() -> Self {
        Self::new()
    }
}

/// The two-list producer pattern: `adding` lives here behind
/// the gate mutex; the loop thread owns a second, private `running`
/// buffer and swaps contents with `adding` each turn, so the gate is held
/// only for the `mem::swap`, never across a pipe write or socket I/O.
pub struct SchedulingGate {
    adding: Mutex<Vec<Arc<TSocket>>>,
    epoll_state: EpollState,
}

impl SchedulingGate {
    pub fn new() -> Self {
        Self {
            adding: Mutex::new(Vec::new()),
            epoll_state: EpollState::new(),
        }
    }

    pub fn epoll_state(&self) -> &EpollState {
        &self.epoll_state
    }

    /// `ScheduleSend`: enqueue `socket` and wake the
    /// loop iff it was parked. Invariant 3 — exactly one
    /// wakeup byte per parked interval — depends on `cas_to_not_blocked`
    /// and the list append happening under the same gate acquisition.
    pub fn schedule_send(&self, socket: Arc<TSocket>, pipe: &WakeupPipe) {
        let mut adding = self.adding.lock();
        let was_blocked = self.epoll_state.cas_to_not_blocked();
        adding.push(socket);
        drop(adding);
        if was_blocked {
            pipe.send(LoopCommand::ActionsPending);
        }
    }

    /// Swaps the gate's `adding` list into `running` (loop-owned scratch),
    /// holding the gate only for the swap itself — no I/O happens while
    /// held.
    pub fn swap_into(&self, running: &mut Vec<Arc<TSocket>>) {
        debug_assert!(running.is_empty());
        let mut adding = self.adding.lock();
        std::mem::swap(&mut *adding, running);
    }

    /// Called once per loop turn after scheduled work has run: if more
    /// sends arrived while processing, wake self; otherwise park.
    pub fn finish_turn(&self, pipe: &WakeupPipe) {
        let adding = self.adding.lock();
        if adding.is_empty() {
            self.epoll_state.mark_blocked();
        } else {
            drop(adding);
            pipe.send(LoopCommand::ActionsPending);
        }
    }
}

impl Default for SchedulingGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_send_wakes_exactly_once_while_parked() {
        let gate = SchedulingGate::new();
        let pipe = WakeupPipe::new().unwrap();
        gate.epoll_state().mark_blocked();

        let sock = Arc::new(crate::socket::TSocket::new(
            -1,
            crate::socket::SocketKind::Client,
            crate::socket::SocketFlags::empty(),
            crate::constants::NO_ZERO_COPY,
            None,
            None,
            Box::new(crate::socket::EchoDelegate::default()),
        ));

        for _ in 0..1000 {
            gate.schedule_send(sock.clone(), &pipe);
        }

        let mut seen = 0;
        pipe.drain(|_| seen += 1);
        assert_eq!(seen, 1, "1000 schedule_send calls while parked must yield exactly 1 wakeup byte");

        let mut running = Vec::new();
        gate.swap_into(&mut running);
        assert_eq!(running.len(), 1000);
    }

    #[test]
    fn schedule_send_does_not_wake_when_not_blocked() {
        let gate = SchedulingGate::new();
        let pipe = WakeupPipe::new().unwrap();
        // Default state is NotBlocked.
        let sock = Arc::new(crate::socket::TSocket::new(
            -1,
            crate::socket::SocketKind::Client,
            crate::socket::SocketFlags::empty(),
            crate::constants::NO_ZERO_COPY,
            None,
            None,
            Box::new(crate::socket::EchoDelegate::default()),
        ));
        gate.schedule_send(sock, &pipe);
        let mut seen = 0;
        pipe.drain(|_| seen += 1);
        assert_eq!(seen, 0);
    }
}
