//! The accept handoff queue: a single-producer (this
//! loop), single-reader (the application) unbounded FIFO of connection
//! records. Built on `crossbeam-channel`, the same crate the Cargo
//! manifest already carries for cross-thread hand-off.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, RecvError, Sender};
use parking_lot::Mutex;

use crate::socket::TSocket;

pub struct AcceptQueue {
    sender: Mutex<Option<Sender<Arc<TSocket>>>>,
    receiver: Receiver<Arc<TSocket>>,
}

impl AcceptQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Loop-side push. Succeeds unconditionally on this unbounded queue
    /// unless the writer has already been completed (`CloseAccept`), in
    /// which case the connection is dropped rather than delivered — by
    /// that point the loop has stopped accepting new work.
    pub fn push(&self, socket: Arc<TSocket>) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(socket);
        }
    }

    /// `AcceptAsync(cancel)`: the single reader's blocking pull. Returns
    /// `None` once the writer has been completed and the queue has
    /// drained.
    pub fn accept(&self) -> Option<Arc<TSocket>> {
        match self.receiver.recv() {
            Ok(socket) => Some(socket),
            Err(RecvError) => None,
        }
    }

    pub fn try_accept(&self) -> Option<Arc<TSocket>> {
        self.receiver.try_recv().ok()
    }

    /// `CloseAccept`: drop the sender so the reader
    /// observes end-of-stream once anything already queued has drained.
    pub fn complete_writer(&self) {
        *self.sender.lock() = None;
    }
}

impl Default for AcceptQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NO_ZERO_COPY;
    use crate::socket::{EchoDelegate, SocketFlags, SocketKind};

    fn socket() -> Arc<TSocket> {
        Arc::new(TSocket::new(
            -1,
            SocketKind::Client,
            SocketFlags::empty(),
            NO_ZERO_COPY,
            None,
            None,
            Box::new(EchoDelegate::default()),
        ))
    }

    #[test]
    fn delivers_in_fifo_order() {
        let q = AcceptQueue::new();
        let a = socket();
        let b = socket();
        q.push(a.clone());
        q.push(b.clone());
        assert!(Arc::ptr_eq(&q.accept().unwrap(), &a));
        assert!(Arc::ptr_eq(&q.accept().unwrap(), &b));
    }

    #[test]
    fn complete_writer_ends_the_stream_after_drain() {
        let q = AcceptQueue::new();
        q.push(socket());
        q.complete_writer();
        assert!(q.accept().is_some());
        assert!(q.accept().is_none());
    }

    #[test]
    fn push_after_complete_writer_is_dropped() {
        let q = AcceptQueue::new();
        q.complete_writer();
        q.push(socket());
        assert!(q.accept().is_none());
    }
}
