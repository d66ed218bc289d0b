//! The loop driver: `Run()`, composing the epoll instance,
//! the wakeup pipe, the FD map, the accept queue, the scheduling gate,
//! and (optionally) the AIO arenas into one per-thread event loop.

use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::accept_queue::AcceptQueue;
use crate::aio::AioArena;
use crate::config::TransportConfig;
use crate::constants::{EVENT_BUFFER_LENGTH, IO_VECTORS_PER_AIO_SOCKET, MAX_EAGAIN_COUNT};
use crate::epoll::Epoll;
use crate::error::{TransportError, TransportResult};
use crate::gate::SchedulingGate;
use crate::memory_pool::{BufferHandle, BufferPool};
use crate::pipe::{LoopCommand, WakeupPipe};
use crate::socket::{ConnectionDelegate, PendingEvents, SocketFlags, SocketKind, TSocket};
use crate::syscall;
use crate::transports::tcp;

/// Where this loop gets its accept socket from.
pub enum AcceptSource {
    /// Bind and listen ourselves.
    Bind,
    /// Receive connection FDs over `SCM_RIGHTS` on this UNIX socket.
    PassFd(RawFd),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    AcceptClosed,
    Stopped,
}

impl LoopState {
    fn to_u8(self) -> u8 {
        match self {
            LoopState::Running => 0,
            LoopState::AcceptClosed => 1,
            LoopState::Stopped => 2,
        }
    }
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Running,
            1 => LoopState::AcceptClosed,
            _ => LoopState::Stopped,
        }
    }
}

/// State shared between the loop thread and foreign producer threads.
/// Nothing here performs I/O while locked.
pub struct Shared {
    fd_map: Mutex<FxHashMap<RawFd, Arc<TSocket>>>,
    accept_sockets: Mutex<Vec<Arc<TSocket>>>,
    accept_queue: AcceptQueue,
    gate: SchedulingGate,
    pipe: WakeupPipe,
    config: TransportConfig,
    state: AtomicU8,
}

/// The producer/consumer handle exposed to other threads.
/// Cheap to clone; every clone refers to the same loop.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// `AcceptAsync(cancel)`. This crate's queue has no cancellation
    /// token of its own; callers that need cancellation race this call
    /// against their own signal on a separate thread.
    pub fn accept_async(&self) -> Option<Arc<TSocket>> {
        self.shared.accept_queue.accept()
    }

    pub fn schedule_send(&self, socket: Arc<TSocket>) {
        self.shared.gate.schedule_send(socket, &self.shared.pipe);
    }

    pub fn request_close_accept(&self) {
        self.shared.pipe.send(LoopCommand::CloseAccept);
    }

    pub fn request_stop_sockets(&self) {
        self.shared.pipe.send(LoopCommand::StopSockets);
    }

    pub fn stop_thread(&self) {
        self.shared.pipe.send(LoopCommand::StopThread);
    }

    /// Callable from any thread (e.g. a socket's own completion path).
    /// Returns `true` if the FD map became empty.
    pub fn remove_socket(&self, fd: RawFd) -> bool {
        let mut map = self.shared.fd_map.lock();
        map.remove(&fd);
        map.is_empty()
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Non-blocking variant of [`Transport::accept_async`], for tests and
    /// callers polling multiple loops without dedicating a thread to each.
    pub fn accept_async_try(&self) -> Option<Arc<TSocket>> {
        self.shared.accept_queue.try_accept()
    }
}

/// The loop-private state: everything here is touched only by the thread
/// running [`EventLoop::run`].
pub struct EventLoop {
    shared: Arc<Shared>,
    epoll: Epoll,
    pool: BufferPool,
    aio_recv: Option<AioArena>,
    aio_send: Option<AioArena>,
    running: bool,

    acceptable: Vec<Arc<TSocket>>,
    readable: Vec<Arc<TSocket>>,
    writable: Vec<Arc<TSocket>>,
    reregister: Vec<Arc<TSocket>>,
    zero_copy_completions: Vec<Arc<TSocket>>,
    pipe_readable: bool,
    running_sends: Vec<Arc<TSocket>>,
    eagain_streak: u32,
}

/// Constructs a loop plus its shared producer handle.
pub fn new_loop(
    config: TransportConfig,
    accept_source: AcceptSource,
    make_delegate: impl Fn() -> Box<dyn ConnectionDelegate> + Send + 'static,
) -> TransportResult<(Transport, EventLoop)> {
    config.validate()?;

    let pipe = WakeupPipe::new().map_err(TransportError::Io)?;
    let mut epoll = Epoll::new(EVENT_BUFFER_LENGTH).map_err(TransportError::Io)?;
    epoll
        .add_level_triggered_readable(pipe.read_fd())
        .map_err(syscall::errno_to_io_error)
        .map_err(TransportError::Io)?;

    let zero_copy_threshold = config.effective_zero_copy_threshold();
    let mut flags = SocketFlags::empty();
    if config.defer_send {
        flags |= SocketFlags::DEFER_SEND;
    }
    if config.defer_accept {
        flags |= SocketFlags::DEFER_ACCEPT;
    }

    let (accept_fd, kind): (RawFd, SocketKind) = match accept_source {
        AcceptSource::Bind => {
            let (socket, _local_addr) = tcp::create_accept_socket(&config)?;
            (socket.into_raw_fd(), SocketKind::Accept)
        }
        AcceptSource::PassFd(fd) => {
            flags |= SocketFlags::PASS_FD;
            (fd, SocketKind::PassFd)
        }
    };

    let accept_socket = Arc::new(TSocket::new(
        accept_fd,
        kind,
        flags,
        zero_copy_threshold,
        tcp::local_addr(accept_fd),
        None,
        make_delegate(),
    ));
    epoll
        .add_level_triggered_readable(accept_fd)
        .map_err(syscall::errno_to_io_error)
        .map_err(TransportError::Io)?;

    let mut fd_map = FxHashMap::default();
    fd_map.insert(accept_fd, accept_socket.clone());

    let aio_recv = if config.aio_receive {
        Some(AioArena::new()?)
    } else {
        None
    };
    let aio_send = if config.aio_send { Some(AioArena::new()?) } else { None };

    let shared = Arc::new(Shared {
        fd_map: Mutex::new(fd_map),
        accept_sockets: Mutex::new(vec![accept_socket]),
        accept_queue: AcceptQueue::new(),
        gate: SchedulingGate::new(),
        pipe,
        config,
        state: AtomicU8::new(LoopState::Running.to_u8()),
    });

    let event_loop = EventLoop {
        shared: shared.clone(),
        epoll,
        pool: BufferPool::new(64 * 1024),
        aio_recv,
        aio_send,
        running: true,
        acceptable: Vec::with_capacity(1),
        readable: Vec::with_capacity(EVENT_BUFFER_LENGTH),
        writable: Vec::with_capacity(EVENT_BUFFER_LENGTH),
        reregister: Vec::with_capacity(EVENT_BUFFER_LENGTH),
        zero_copy_completions: Vec::with_capacity(EVENT_BUFFER_LENGTH),
        pipe_readable: false,
        running_sends: Vec::new(),
        eagain_streak: 0,
    };

    Ok((Transport { shared }, event_loop))
}

impl EventLoop {
    /// The bound address of this loop's own accept socket, if it created
    /// one (as opposed to receiving FDs via [`AcceptSource::PassFd`]).
    /// Exposed for tests that bind an ephemeral port and need to learn
    /// which one the kernel picked.
    pub fn accept_socket_addr_for_test(&self) -> Option<std::net::SocketAddr> {
        self.shared.accept_sockets.lock().first()?.local_addr()
    }

    /// `Run()`: executes until a `StopThread` command,
    /// then disposes every resource this loop owns.
    pub fn run(mut self) {
        while self.running {
            self.turn();
        }
        self.dispose();
    }

    fn turn(&mut self) {
        // Step 1: park.
        let n = match self.epoll.wait() {
            Ok(n) => n as usize,
            Err(errno) => {
                log::error!("epoll_wait failed, errno {errno}: aborting loop");
                self.running = false;
                return;
            }
        };
        self.shared.gate.epoll_state().mark_not_blocked();

        // Step 2: classify, under the map mutex.
        self.acceptable.clear();
        self.readable.clear();
        self.writable.clear();
        self.reregister.clear();
        self.zero_copy_completions.clear();
        self.pipe_readable = false;

        let pipe_fd = self.shared.pipe.read_fd();
        let events: Vec<_> = self.epoll.ready_events(n).collect();
        {
            let map = self.shared.fd_map.lock();
            for ev in events {
                if ev.fd == pipe_fd {
                    self.pipe_readable = true;
                    continue;
                }
                let Some(sock) = map.get(&ev.fd) else {
                    // Stale FD: already removed from the map. Silently
                    // ignored.
                    continue;
                };
                match sock.kind() {
                    SocketKind::Accept | SocketKind::PassFd => {
                        self.acceptable.push(sock.clone());
                    }
                    SocketKind::Client => {
                        let mut gate = sock.gate().lock();
                        let got = PendingEvents::from_bits_truncate(ev.events)
                            & gate.pending
                            & (PendingEvents::READABLE | PendingEvents::WRITABLE | PendingEvents::ERRORED);

                        let had_error = got.contains(PendingEvents::ERRORED);
                        drop(gate);

                        // EPOLLERR is routed through the zero-copy
                        // completion path exclusively (§4.4); it is never
                        // drained as read+write here. ERRORED is left set
                        // in the pending mask until
                        // `handle_zero_copy_completions` resolves it —
                        // cleared on a clean completion, left armed (and
                        // promoted to read+write) if it survives.
                        if had_error {
                            self.zero_copy_completions.push(sock.clone());
                        }
                        if got.contains(PendingEvents::READABLE) {
                            self.readable.push(sock.clone());
                        }
                        if got.contains(PendingEvents::WRITABLE) {
                            self.writable.push(sock.clone());
                        }

                        let mut gate = sock.gate().lock();
                        let serviced = got & (PendingEvents::READABLE | PendingEvents::WRITABLE);
                        gate.pending.remove(serviced);
                        if !gate.pending.is_empty() {
                            gate.pending.insert(PendingEvents::EVENT_CONTROL_PENDING);
                            drop(gate);
                            self.reregister.push(sock.clone());
                        }
                    }
                }
            }
        }

        // Step 3: dispatch, fixed order.
        self.handle_zero_copy_completions();
        self.handle_accepts();
        self.handle_writes();
        self.handle_reads();
        self.rearm_sockets();
        if self.pipe_readable {
            self.drain_pipe_commands();
        }

        // Step 4: scheduled work.
        self.do_scheduled_work();
    }

    fn handle_zero_copy_completions(&mut self) {
        let sockets = std::mem::take(&mut self.zero_copy_completions);
        for sock in &sockets {
            match sock.complete_zero_copy() {
                // No completion yet: EPOLLERR stays armed and no
                // zero-copy-specific callback fires this turn. It still
                // may be a genuine socket error rather than a pending
                // completion, so it is left eligible for promotion below.
                Err(errno) if errno == libc::EAGAIN => {}
                Ok(_) => {
                    let mut gate = sock.gate().lock();
                    gate.pending.remove(PendingEvents::ERRORED);
                    drop(gate);
                    sock.on_zero_copy_completed();
                }
                Err(errno) => {
                    log::error!("fatal: unexpected CompleteZeroCopy result, errno {errno}");
                    self.running = false;
                }
            }
        }

        // Promotion to EPOLLIN|EPOLLOUT happens only after zero-copy
        // handling, and only for sockets whose ERRORED bit survived
        // (the EAGAIN case above) — a clean completion clears it and is
        // not drained as read+write.
        for sock in sockets {
            let survived = sock.gate().lock().pending.contains(PendingEvents::ERRORED);
            if survived {
                self.readable.push(sock.clone());
                self.writable.push(sock.clone());
            }
        }
    }

    fn handle_accepts(&mut self) {
        for accept_sock in std::mem::take(&mut self.acceptable) {
            // Exactly one accept per event, to preserve SO_REUSEPORT
            // balance.
            let accepted_fd = if accept_sock.flags().contains(SocketFlags::PASS_FD) {
                match syscall::read_byte(accept_sock.fd(), &mut [0u8; 1]) {
                    Ok(0) => {
                        self.close_accept_socket(&accept_sock);
                        None
                    }
                    // SCM_RIGHTS extraction itself belongs to the pass-fd
                    // channel's own ancillary-message handling, outside
                    // this crate's syscall surface.
                    Ok(_) => None,
                    Err(errno) if errno == libc::EAGAIN => None,
                    Err(_) => {
                        self.close_accept_socket(&accept_sock);
                        None
                    }
                }
            } else {
                tcp::accept_one(accept_sock.fd()).unwrap_or(None)
            };

            let Some(client_fd) = accepted_fd else { continue };

            tcp::apply_client_socket_options(client_fd);
            let local = tcp::local_addr(client_fd);
            let peer = tcp::peer_addr(client_fd);

            let client = Arc::new(TSocket::new(
                client_fd,
                SocketKind::Client,
                accept_sock.flags(),
                accept_sock.zero_copy_threshold(),
                local,
                peer,
                Box::new(crate::socket::EchoDelegate::default()),
            ));

            self.shared.accept_queue.push(client.clone());
            self.shared.fd_map.lock().insert(client_fd, client.clone());
            client.start(accept_sock.flags().contains(SocketFlags::DEFER_ACCEPT));
            client.request_events(PendingEvents::READABLE);
            self.reregister.push(client);
        }
    }

    fn close_accept_socket(&mut self, accept_sock: &Arc<TSocket>) {
        self.epoll.remove(accept_sock.fd());
        self.shared.fd_map.lock().remove(&accept_sock.fd());
        self.shared
            .accept_sockets
            .lock()
            .retain(|s| s.fd() != accept_sock.fd());
        accept_sock.close();
    }

    fn handle_writes(&mut self) {
        for sock in std::mem::take(&mut self.writable) {
            sock.on_writable(false);
            if let Some(chunk) = sock.get_read_result() {
                let result = syscall::writev(
                    sock.fd(),
                    &[libc::iovec {
                        iov_base: chunk.as_ptr() as *mut _,
                        iov_len: chunk.len(),
                    }],
                );
                match result {
                    Ok(n) => {
                        // Requeuing already happened inside
                        // handle_send_result; this path re-arms via
                        // epoll readiness below rather than the
                        // scheduling gate, so the return is unused here.
                        let _ = sock.handle_send_result(&chunk, n);
                        if (n as usize) < chunk.len() {
                            sock.request_events(PendingEvents::WRITABLE);
                            self.reregister.push(sock.clone());
                        }
                    }
                    Err(errno) if errno == libc::EAGAIN => {
                        sock.request_events(PendingEvents::WRITABLE);
                        self.reregister.push(sock.clone());
                    }
                    Err(errno) => sock.complete_output(Some(errno)),
                }
            }
        }
    }

    fn handle_reads(&mut self) {
        if self.aio_recv.is_some() && !self.readable.is_empty() {
            self.aio_receive_batch();
        } else {
            for sock in std::mem::take(&mut self.readable) {
                let mut buf = [0u8; 64 * 1024];
                if let Ok(n) = sock.receive_sync(&mut buf) {
                    if n > 0 {
                        sock.request_events(PendingEvents::READABLE);
                        self.reregister.push(sock.clone());
                    }
                }
            }
        }
    }

    /// AIO receive batching.
    fn aio_receive_batch(&mut self) {
        let mut batch: Vec<Arc<TSocket>> = std::mem::take(&mut self.readable);
        let mut received = vec![0u64; batch.len()];
        let mut handles: Vec<BufferHandle> = Vec::new();
        let mut iov_counts = vec![0usize; batch.len()];
        let mut advanced = vec![0u32; batch.len()];

        loop {
            let n = batch.len();
            if n == 0 {
                break;
            }

            {
                let arena = self.aio_recv.as_mut().unwrap();
                for (i, sock) in batch.iter().enumerate() {
                    let before = handles.len();
                    let iovecs = arena.iovecs_for(i);
                    advanced[i] = sock.fill_receive_iovec(&self.pool, iovecs, &mut handles);
                    iov_counts[i] = handles.len() - before;
                    let iovecs_ptr = iovecs.as_ptr();
                    let cb = arena.iocb_mut(i);
                    cb.aio_fildes = sock.fd() as u32;
                    cb.aio_lio_opcode = syscall::IOCB_CMD_PREADV;
                    cb.aio_buf = iovecs_ptr as u64;
                    cb.aio_nbytes = iov_counts[i] as u64;
                    cb.aio_data =
                        crate::aio::pack_aio_data(received[i] as u32, advanced[i], iov_counts[i] as u32);
                }
            }

            let arena = self.aio_recv.as_mut().unwrap();
            if let Err(e) = arena.submit(n) {
                log::error!("fatal AIO receive error: {e}");
                self.running = false;
                break;
            }
            let events = match arena.get_events(n) {
                Ok(events) => events.to_vec(),
                Err(e) => {
                    log::error!("fatal AIO receive error: {e}");
                    self.running = false;
                    break;
                }
            };

            // `io_event.obj` echoes back the iocb pointer we submitted,
            // so it identifies which batch slot completed regardless of
            // the order `io_getevents` returns them in.
            let mut obj_to_index: FxHashMap<u64, usize> = FxHashMap::default();
            {
                let arena = self.aio_recv.as_ref().unwrap();
                for i in 0..n {
                    obj_to_index.insert(arena.iocb_ptr(i), i);
                }
            }

            let mut keep = vec![false; n];
            let mut all_eagain = true;
            for ev in &events {
                let i = *obj_to_index
                    .get(&ev.obj)
                    .expect("completion references an iocb submitted this batch");
                let sock = &batch[i];
                // Recover `advanced` and the iovec count from the echoed
                // aio_data rather than the local side tables, so the
                // packing this batch wrote into the iocb is actually the
                // thing read back.
                let (_, adv, iov_len) = crate::aio::unpack_aio_data(ev.data);
                let live_iovecs: Vec<libc::iovec> = {
                    let arena = self.aio_recv.as_mut().unwrap();
                    arena.iovecs_for(i)[..iov_len as usize].to_vec()
                };
                let (done, retval) =
                    sock.interpret_receive_result(ev.res, &mut received[i], adv, &live_iovecs);
                if done {
                    sock.on_receive_from_socket(retval);
                    if retval > 0 {
                        sock.request_events(PendingEvents::READABLE);
                        self.reregister.push(sock.clone());
                    }
                } else {
                    all_eagain &= ev.res == -(libc::EAGAIN as i64);
                    keep[i] = true;
                }
            }

            if keep.iter().all(|k| !*k) {
                self.eagain_streak = 0;
                break;
            }
            if all_eagain {
                self.eagain_streak += 1;
                if self.eagain_streak >= MAX_EAGAIN_COUNT {
                    log::error!(
                        "AIO receive: {MAX_EAGAIN_COUNT} consecutive all-EAGAIN retries, aborting"
                    );
                    self.running = false;
                    break;
                }
            } else {
                self.eagain_streak = 0;
            }

            // Mark finished iocbs IOCB_CMD_NOOP and compact the retained
            // ones down; the parallel side tables are compacted in
            // lockstep using the same mask and the same left-to-right
            // order, so index i still lines up after this.
            let new_n = {
                let arena = self.aio_recv.as_mut().unwrap();
                arena.compact_retained(n, &keep)
            };

            let mut next_batch = Vec::with_capacity(new_n);
            let mut next_received = Vec::with_capacity(new_n);
            let mut next_counts = Vec::with_capacity(new_n);
            let mut next_advanced = Vec::with_capacity(new_n);
            for (i, keep_it) in keep.iter().enumerate() {
                if *keep_it {
                    next_batch.push(batch[i].clone());
                    next_received.push(received[i]);
                    next_counts.push(iov_counts[i]);
                    next_advanced.push(advanced[i]);
                }
            }
            debug_assert_eq!(new_n, next_batch.len());
            batch = next_batch;
            received = next_received;
            iov_counts = next_counts;
            advanced = next_advanced;
        }

        for h in handles {
            self.pool.release(h);
        }
    }

    fn rearm_sockets(&mut self) {
        for sock in std::mem::take(&mut self.reregister) {
            let mask = {
                let mut gate = sock.gate().lock();
                gate.pending.remove(PendingEvents::EVENT_CONTROL_PENDING);
                (gate.pending & (PendingEvents::READABLE | PendingEvents::WRITABLE | PendingEvents::ERRORED))
                    .bits()
            };
            if let Err(errno) = self.epoll.arm_oneshot(sock.fd(), mask) {
                log::warn!("epoll re-arm failed for fd {}: errno {errno}", sock.fd());
            }
        }
    }

    fn drain_pipe_commands(&mut self) {
        let shared = self.shared.clone();
        let mut stop_thread = false;
        let mut stop_sockets = false;
        let mut close_accept = false;
        shared.pipe.drain(|cmd| match cmd {
            LoopCommand::StopThread => stop_thread = true,
            LoopCommand::ActionsPending => {}
            LoopCommand::StopSockets => stop_sockets = true,
            LoopCommand::CloseAccept => close_accept = true,
        });

        if stop_sockets {
            let sockets: Vec<_> = self.shared.fd_map.lock().values().cloned().collect();
            for sock in sockets {
                sock.abort();
            }
        }

        if close_accept {
            let accept_sockets: Vec<_> = self.shared.accept_sockets.lock().drain(..).collect();
            for sock in &accept_sockets {
                self.epoll.remove(sock.fd());
                self.shared.fd_map.lock().remove(&sock.fd());
                sock.close();
            }
            self.shared.accept_queue.complete_writer();
            self.shared
                .state
                .store(LoopState::AcceptClosed.to_u8(), Ordering::Release);
            if self.shared.fd_map.lock().is_empty() {
                stop_thread = true;
            }
        }

        if stop_thread {
            self.running = false;
        }
    }

    /// Deferred send & AIO send.
    fn do_scheduled_work(&mut self) {
        self.running_sends.clear();
        self.shared.gate.swap_into(&mut self.running_sends);
        let sends = std::mem::take(&mut self.running_sends);

        if self.aio_send.is_some() {
            self.aio_send_batch(sends);
        } else {
            for sock in sends {
                // A partial write (or an EAGAIN that sent nothing) must
                // be scheduled for another send pass; nothing else
                // re-examines this socket's outbound queue otherwise.
                if let Some((_, needs_resend)) = sock.do_deferred_send() {
                    if needs_resend {
                        self.shared.gate.schedule_send(sock, &self.shared.pipe);
                    }
                }
            }
        }

        self.shared.gate.finish_turn(&self.shared.pipe);
    }

    fn aio_send_batch(&mut self, mut queue: Vec<Arc<TSocket>>) {
        while !queue.is_empty() {
            let take = queue.len().min(EVENT_BUFFER_LENGTH);
            let mut batch: Vec<(Arc<TSocket>, Vec<u8>)> = Vec::with_capacity(take);

            for sock in queue.drain(..take) {
                if let Some(chunk) = sock.get_read_result() {
                    if !chunk.is_empty() {
                        batch.push((sock, chunk));
                    }
                }
            }

            let n = batch.len();
            if n == 0 {
                continue;
            }

            let arena = self.aio_send.as_mut().unwrap();
            for (i, (sock, chunk)) in batch.iter().enumerate() {
                let iovecs = arena.iovecs_for(i);
                sock.fill_send_iovec(iovecs, chunk);
                let iovecs_ptr = iovecs.as_ptr();
                let len = sock.calc_iovec_length_for_send(chunk) as u64;
                let cb = arena.iocb_mut(i);
                cb.aio_fildes = sock.fd() as u32;
                cb.aio_lio_opcode = syscall::IOCB_CMD_PWRITEV;
                cb.aio_buf = iovecs_ptr as u64;
                cb.aio_nbytes = len;
                cb.aio_data = i as u64;
            }
            if let Err(e) = arena.submit(n) {
                log::error!("fatal AIO send error: {e}");
                self.running = false;
                return;
            }
            match arena.get_events(n) {
                Ok(events) => {
                    let events = events.to_vec();
                    for ev in events {
                        let (sock, chunk) = &batch[ev.data as usize];
                        // Same reasoning as the non-AIO deferred-send
                        // path: a partial write must be rescheduled, or
                        // the residual bytes never go out.
                        if sock.handle_send_result(chunk, ev.res) {
                            self.shared.gate.schedule_send(sock.clone(), &self.shared.pipe);
                        }
                    }
                }
                Err(e) => {
                    log::error!("fatal AIO send error: {e}");
                    self.running = false;
                    return;
                }
            }
        }
    }

    /// Disposal: abort anything still sitting undelivered
    /// in the accept queue, then let `Drop` reclaim epoll/pipe/AIO/pool.
    fn dispose(mut self) {
        while let Some(sock) = self.shared.accept_queue.try_accept() {
            sock.abort();
        }
        self.shared
            .state
            .store(LoopState::Stopped.to_u8(), Ordering::Release);
        self.aio_recv.take();
        self.aio_send.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::time::Duration;

    fn echo_config() -> TransportConfig {
        TransportConfig::new("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn connect_and_accept_delivers_a_socket() {
        let (transport, event_loop) = new_loop(echo_config(), AcceptSource::Bind, || {
            Box::new(crate::socket::EchoDelegate::default())
        })
        .unwrap();

        let addr = {
            let sockets = event_loop.shared.accept_sockets.lock();
            sockets[0].local_addr().unwrap()
        };

        let handle = std::thread::spawn(move || event_loop.run());

        let _client = TcpStream::connect(addr).expect("connect");
        std::thread::sleep(Duration::from_millis(50));

        let accepted = transport.accept_async();
        assert!(accepted.is_some());

        transport.stop_thread();
        handle.join().unwrap();
    }

    #[test]
    fn close_accept_then_stop_ends_the_loop() {
        let (transport, event_loop) = new_loop(echo_config(), AcceptSource::Bind, || {
            Box::new(crate::socket::EchoDelegate::default())
        })
        .unwrap();

        let handle = std::thread::spawn(move || event_loop.run());
        std::thread::sleep(Duration::from_millis(20));
        transport.request_close_accept();
        handle.join().unwrap();
        assert_eq!(transport.state(), LoopState::Stopped);
    }
}
