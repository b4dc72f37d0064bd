use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nodecall_codec::Buffer;
use nodecall_frame::{encode_header, FrameAssembler};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::context::{Context, ContextConfig, ContextId, ListenerId};
use crate::error::{NetError, Result};
use crate::event::{Event, EventOutcome, LoopHandle, LoopState, Queued, SharedState};
use crate::handler::{CloseReason, ConnectFailure, Handler, OpenInfo};
use crate::socket::{IoEvent, Origin, Socket, SocketId};

thread_local! {
    static LOOP_RUNNING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a loop until dropped.
struct RunningGuard;

impl RunningGuard {
    fn acquire() -> Result<Self> {
        LOOP_RUNNING.with(|running| {
            if running.get() {
                return Err(NetError::LoopAlreadyRunning);
            }
            running.set(true);
            Ok(Self)
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        LOOP_RUNNING.with(|running| running.set(false));
    }
}

/// Loop timing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Interval between drain passes while deferred events are parked.
    pub tick: Duration,
    /// How long a stopping loop waits for queued writes to flush.
    pub drain_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(5),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Single-threaded event loop driving every socket and event of its
/// contexts.
///
/// Producers on other threads talk to the loop only through a
/// [`LoopHandle`]. Everything else (sockets, reassembly state, the handler)
/// is touched on the loop thread alone.
pub struct Loop<H: Handler> {
    handler: H,
    net: Net<H>,
    events: mpsc::UnboundedReceiver<Queued<H>>,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
}

impl<H: Handler> Loop<H> {
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, LoopConfig::default())
    }

    pub fn with_config(handler: H, config: LoopConfig) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SharedState::default());
        let handle = LoopHandle::new(tx, Arc::clone(&state));

        Self {
            handler,
            net: Net {
                config,
                handle,
                state,
                contexts: Vec::new(),
                sockets: HashMap::new(),
                inbox: VecDeque::new(),
                parked: Vec::new(),
                closed: Vec::new(),
                closing_writers: Vec::new(),
                io_tx,
                next_socket: 1,
                next_listener: 1,
                passes: 0,
            },
            events,
            io_rx,
        }
    }

    /// A handle for pushing events from any thread.
    pub fn handle(&self) -> LoopHandle<H> {
        self.net.handle.clone()
    }

    /// Register a connection context. TLS material is loaded here.
    pub fn add_context(&mut self, config: ContextConfig) -> Result<ContextId> {
        self.net.add_context(config)
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn state(&self) -> LoopState {
        self.net.state()
    }

    /// Run the loop on the calling thread until a `Stop` event drains it.
    ///
    /// Returns the handler so callers can inspect its final state. Fails with
    /// [`NetError::LoopAlreadyRunning`] when this thread already runs a loop.
    pub fn run(self) -> Result<H> {
        let _guard = RunningGuard::acquire()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(NetError::Runtime)?;

        let mut this = self;
        runtime.block_on(this.drive());

        let Loop { handler, net, .. } = this;
        drop(net);
        drop(runtime);
        Ok(handler)
    }

    async fn drive(&mut self) {
        self.net.state.set(LoopState::Running);
        info!(contexts = self.net.contexts.len(), "event loop running");

        let mut tick = tokio::time::interval(self.net.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let parked = !self.net.parked.is_empty();
            tokio::select! {
                Some(io) = self.io_rx.recv() => {
                    self.on_io(io);
                    while let Ok(io) = self.io_rx.try_recv() {
                        self.on_io(io);
                    }
                }
                Some(queued) = self.events.recv() => self.net.inbox.push_back(queued),
                _ = tick.tick(), if parked => {}
                else => break,
            }

            self.drain_pass();
            if self.net.state() == LoopState::Draining {
                break;
            }
        }

        self.shutdown().await;
        self.net.state.set(LoopState::Stopped);
        info!("event loop stopped");
    }

    /// Examine every parked and newly queued event once.
    fn drain_pass(&mut self) {
        self.net.passes += 1;
        while let Ok(queued) = self.events.try_recv() {
            self.net.inbox.push_back(queued);
        }

        let mut batch: VecDeque<Queued<H>> = self.net.parked.drain(..).collect();
        batch.append(&mut self.net.inbox);

        for mut queued in batch {
            if queued.defer > 0 {
                queued.defer -= 1;
                self.net.parked.push(queued);
            } else {
                self.execute(queued);
            }
        }

        if self.net.state() == LoopState::Draining {
            self.drop_pending();
        }
    }

    /// Run what is still queued once, then drop everything deferred.
    fn drop_pending(&mut self) {
        let mut late = Vec::new();
        while let Ok(queued) = self.events.try_recv() {
            late.push(queued);
        }
        for queued in late {
            if queued.defer == 0 {
                self.execute(queued);
            } else {
                self.net.parked.push(queued);
            }
        }

        let parked = std::mem::take(&mut self.net.parked);
        if !parked.is_empty() {
            debug!(count = parked.len(), "dropping deferred events");
        }
        for queued in parked {
            if let Some(after) = queued.after {
                after(&mut self.handler, &mut self.net, EventOutcome::Dropped);
            }
        }
        self.notify_closed();
    }

    fn execute(&mut self, queued: Queued<H>) {
        let Queued { event, after, .. } = queued;
        let kind = event.kind();
        trace!(kind, "executing event");

        let outcome = match event {
            Event::ListenStart {
                context,
                host,
                port,
            } => match self.net.listen(context, &host, port) {
                Ok((listener, addr)) => EventOutcome::Listening { listener, addr },
                Err(err) => {
                    warn!(%context, %host, port, error = %err, "listen failed");
                    EventOutcome::Failed(err)
                }
            },
            Event::ListenStop { context, port } => match self.net.stop_listening(context, port) {
                Ok(_) => EventOutcome::Completed,
                Err(err) => EventOutcome::Failed(err),
            },
            Event::Connect {
                context,
                host,
                port,
                tag,
            } => match self.net.connect(context, &host, port, tag) {
                Ok(()) => EventOutcome::Completed,
                Err(err) => EventOutcome::Failed(err),
            },
            Event::CloseSocket { socket } => {
                if self.net.close(socket) {
                    EventOutcome::Completed
                } else {
                    EventOutcome::Failed(NetError::UnknownSocket(socket))
                }
            }
            Event::Send { socket, payload } => match self.net.send(socket, payload) {
                Ok(()) => EventOutcome::Completed,
                Err(err) => EventOutcome::Failed(err),
            },
            Event::BroadcastContext { context, payload } => {
                match self.net.broadcast_context(context, payload) {
                    Ok(count) => EventOutcome::Broadcast(count),
                    Err(err) => EventOutcome::Failed(err),
                }
            }
            Event::BroadcastLoop { payload } => EventOutcome::Broadcast(self.net.broadcast(payload)),
            Event::Custom(action) => {
                action(&mut self.handler, &mut self.net);
                EventOutcome::Completed
            }
            Event::Stop => {
                self.net.stop();
                EventOutcome::Completed
            }
        };

        match after {
            Some(after) => after(&mut self.handler, &mut self.net, outcome),
            None => {
                if let EventOutcome::Failed(err) = &outcome {
                    debug!(kind, error = %err, "event failed");
                }
            }
        }
        self.notify_closed();
    }

    fn on_io(&mut self, io: IoEvent) {
        match io {
            IoEvent::Opened {
                context,
                stream,
                origin,
            } => self.on_opened(context, stream, origin),
            IoEvent::ConnectFailed {
                context,
                host,
                port,
                tag,
                error,
            } => {
                warn!(%context, %host, port, ?tag, error = %error, "connect failed");
                let failure = ConnectFailure {
                    context,
                    host,
                    port,
                    tag,
                    error,
                };
                self.handler.on_connect_failed(&mut self.net, &failure);
            }
            IoEvent::Data { socket, chunk } => self.on_data(socket, chunk),
            IoEvent::End { socket } => {
                if self.net.is_open(socket) {
                    debug!(%socket, "peer ended stream");
                    self.handler.on_end(&mut self.net, socket);
                    self.net.close_with(socket, CloseReason::PeerClosed);
                }
            }
            IoEvent::Timeout { socket } => {
                if self.net.is_open(socket) {
                    debug!(%socket, "idle timeout");
                    self.handler.on_timeout(&mut self.net, socket);
                    self.net.close_with(socket, CloseReason::Timeout);
                }
            }
            IoEvent::Writable { socket } => {
                if self.net.is_open(socket) {
                    self.handler.on_writable(&mut self.net, socket);
                }
            }
            IoEvent::Failed { socket, error } => {
                if self.net.is_open(socket) {
                    self.net.close_with(socket, CloseReason::Io(error));
                }
            }
        }
        self.notify_closed();
    }

    fn on_opened(
        &mut self,
        context: ContextId,
        stream: nodecall_transport::NetStream,
        origin: Origin,
    ) {
        let Some(ctx) = self.net.contexts.get_mut(context.as_raw()) else {
            return;
        };

        let id = SocketId::from_raw(self.net.next_socket);
        self.net.next_socket += 1;

        let (is_client, tag, listener) = match origin {
            Origin::Accepted { listener } => (false, None, Some(listener)),
            Origin::Connected { tag } => (true, tag, None),
        };
        let tls = stream.is_tls();
        let socket = Socket::spawn(
            id,
            context,
            stream,
            is_client,
            FrameAssembler::with_config(&ctx.config.frame),
            ctx.config.idle_timeout,
            self.net.io_tx.clone(),
        );
        ctx.sockets.insert(id);

        let info = OpenInfo {
            socket: id,
            context,
            peer_addr: socket.peer_addr,
            local_addr: socket.local_addr,
            is_client,
            tag,
            listener,
            tls,
        };
        self.net.sockets.insert(id, socket);

        info!(
            socket = %id,
            %context,
            peer = %info.peer_addr,
            is_client,
            tls,
            "socket open"
        );
        self.handler.on_open(&mut self.net, &info);
    }

    fn on_data(&mut self, socket: SocketId, chunk: Bytes) {
        let mut frames = Vec::new();
        let result = match self.net.sockets.get_mut(&socket) {
            Some(entry) => entry.assembler.push(&chunk, |frame| frames.push(frame)),
            None => return,
        };

        for frame in frames {
            // The handler may have closed the socket on an earlier frame.
            if !self.net.is_open(socket) {
                break;
            }
            debug!(%socket, len = frame.len(), "frame received");
            self.handler.on_message(&mut self.net, socket, frame);
        }

        if let Err(err) = result {
            warn!(%socket, error = %err, "closing socket after framing error");
            self.net.close_with(socket, CloseReason::Protocol(err));
        }
    }

    fn notify_closed(&mut self) {
        loop {
            let closed = std::mem::take(&mut self.net.closed);
            if closed.is_empty() {
                return;
            }
            for (socket, reason) in closed {
                self.handler.on_close(&mut self.net, socket, &reason);
            }
        }
    }

    async fn shutdown(&mut self) {
        for ctx in &mut self.net.contexts {
            ctx.stop_listening(None);
        }

        let open: Vec<SocketId> = self.net.sockets.keys().copied().collect();
        for socket in open {
            self.net.close_with(socket, CloseReason::Shutdown);
        }

        let writers = std::mem::take(&mut self.net.closing_writers);
        let deadline = tokio::time::Instant::now() + self.net.config.drain_timeout;
        for writer in writers {
            if tokio::time::timeout_at(deadline, writer).await.is_err() {
                warn!("timed out flushing socket writes during shutdown");
                break;
            }
        }
        self.notify_closed();
    }
}

/// Loop state reachable from handlers, custom events and `after` callbacks.
///
/// Operations here run inline on the loop thread; nothing is queued unless
/// explicitly deferred.
pub struct Net<H> {
    config: LoopConfig,
    handle: LoopHandle<H>,
    state: Arc<SharedState>,
    contexts: Vec<Context>,
    sockets: HashMap<SocketId, Socket>,
    inbox: VecDeque<Queued<H>>,
    parked: Vec<Queued<H>>,
    closed: Vec<(SocketId, CloseReason)>,
    closing_writers: Vec<JoinHandle<()>>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    next_socket: u64,
    next_listener: u64,
    passes: u64,
}

impl<H: Handler> Net<H> {
    pub fn handle(&self) -> &LoopHandle<H> {
        &self.handle
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    /// Number of drain passes so far.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn add_context(&mut self, config: ContextConfig) -> Result<ContextId> {
        let id = ContextId::from_raw(self.contexts.len());
        let context = Context::new(id, config)?;
        debug!(context = %id, tls = context.tls.is_some(), "context added");
        self.contexts.push(context);
        Ok(id)
    }

    pub fn context_config(&self, context: ContextId) -> Option<&ContextConfig> {
        self.contexts
            .get(context.as_raw())
            .map(|ctx| &ctx.config)
    }

    fn context_mut(&mut self, context: ContextId) -> Result<&mut Context> {
        self.contexts
            .get_mut(context.as_raw())
            .ok_or(NetError::UnknownContext(context))
    }

    /// Bind a listener under `context`.
    pub fn listen(
        &mut self,
        context: ContextId,
        host: &str,
        port: u16,
    ) -> Result<(ListenerId, SocketAddr)> {
        let listener = ListenerId::from_raw(self.next_listener);
        let io_tx = self.io_tx.clone();
        let addr = self.context_mut(context)?.listen(listener, host, port, io_tx)?;
        self.next_listener += 1;
        Ok((listener, addr))
    }

    /// Stop the context's listener on `port`, or all of them.
    pub fn stop_listening(&mut self, context: ContextId, port: Option<u16>) -> Result<usize> {
        let stopped = self.context_mut(context)?.stop_listening(port);
        info!(%context, ?port, stopped, "stopped listening");
        Ok(stopped)
    }

    /// Start an outbound connection. The result arrives as `on_open` or
    /// `on_connect_failed`, carrying `tag`.
    pub fn connect(
        &mut self,
        context: ContextId,
        host: &str,
        port: u16,
        tag: Option<u64>,
    ) -> Result<()> {
        let ctx = self
            .contexts
            .get(context.as_raw())
            .ok_or(NetError::UnknownContext(context))?;
        let tls = ctx.tls.clone();
        let timeout = ctx.config.connect_timeout;
        let io_tx = self.io_tx.clone();
        let host = host.to_string();

        info!(%context, %host, port, ?tag, "connecting");
        tokio::spawn(async move {
            let event = match nodecall_transport::connect(&host, port, tls.as_ref(), timeout).await
            {
                Ok(stream) => IoEvent::Opened {
                    context,
                    stream,
                    origin: Origin::Connected { tag },
                },
                Err(error) => IoEvent::ConnectFailed {
                    context,
                    host,
                    port,
                    tag,
                    error,
                },
            };
            let _ = io_tx.send(event);
        });
        Ok(())
    }

    /// Frame and queue `payload` on `socket`.
    pub fn send(&mut self, socket: SocketId, payload: Buffer) -> Result<()> {
        self.send_bytes(socket, payload.freeze())
    }

    /// Frame and queue shared bytes on `socket`.
    pub fn send_bytes(&mut self, socket: SocketId, payload: Bytes) -> Result<()> {
        let entry = self
            .sockets
            .get(&socket)
            .ok_or(NetError::UnknownSocket(socket))?;
        let max = self.contexts[entry.context.as_raw()].config.frame.max_frame_size;
        let header = encode_header(payload.len(), max)?;
        let len = payload.len();
        if !entry.queue(header, payload) {
            return Err(NetError::UnknownSocket(socket));
        }
        trace!(%socket, len, "frame queued");
        Ok(())
    }

    /// Send to every socket of `context`. Returns how many were reached.
    pub fn broadcast_context(&mut self, context: ContextId, payload: Buffer) -> Result<usize> {
        let targets: Vec<SocketId> = self
            .contexts
            .get(context.as_raw())
            .ok_or(NetError::UnknownContext(context))?
            .sockets
            .iter()
            .copied()
            .collect();
        Ok(self.send_all(targets, payload.freeze()))
    }

    /// Send to every socket of the loop. Returns how many were reached.
    pub fn broadcast(&mut self, payload: Buffer) -> usize {
        let targets: Vec<SocketId> = self.sockets.keys().copied().collect();
        self.send_all(targets, payload.freeze())
    }

    fn send_all(&mut self, targets: Vec<SocketId>, payload: Bytes) -> usize {
        let mut reached = 0;
        for socket in targets {
            match self.send_bytes(socket, payload.clone()) {
                Ok(()) => reached += 1,
                Err(err) => debug!(%socket, error = %err, "broadcast skipped socket"),
            }
        }
        reached
    }

    /// Close a socket locally. Returns false if it was already gone.
    pub fn close(&mut self, socket: SocketId) -> bool {
        self.close_with(socket, CloseReason::Local)
    }

    pub(crate) fn close_with(&mut self, socket: SocketId, reason: CloseReason) -> bool {
        let Some(entry) = self.sockets.remove(&socket) else {
            return false;
        };
        if let Some(ctx) = self.contexts.get_mut(entry.context.as_raw()) {
            ctx.sockets.remove(&socket);
        }
        info!(socket = %entry.id, peer = %entry.peer_addr, %reason, "socket closed");

        let writer = entry.close();
        if self.state() == LoopState::Draining {
            self.closing_writers.push(writer);
        }
        self.closed.push((socket, reason));
        true
    }

    /// Park `event` for `defer` drain passes.
    pub fn defer(&mut self, defer: u32, event: Event<H>) {
        self.defer_queued(Queued::new(event).deferred(defer));
    }

    pub fn defer_queued(&mut self, queued: Queued<H>) {
        self.parked.push(queued);
    }

    /// Begin draining. The loop stops after the current pass.
    pub fn stop(&mut self) {
        if matches!(self.state(), LoopState::Created | LoopState::Running) {
            info!("event loop draining");
            self.state.set(LoopState::Draining);
        }
    }

    pub fn is_open(&self, socket: SocketId) -> bool {
        self.sockets.contains_key(&socket)
    }

    pub fn peer_addr(&self, socket: SocketId) -> Option<SocketAddr> {
        self.sockets.get(&socket).map(|entry| entry.peer_addr)
    }

    pub fn socket_context(&self, socket: SocketId) -> Option<ContextId> {
        self.sockets.get(&socket).map(|entry| entry.context)
    }

    /// Whether this side dialed the socket.
    pub fn is_client(&self, socket: SocketId) -> Option<bool> {
        self.sockets.get(&socket).map(|entry| entry.is_client)
    }

    /// Bytes queued on `socket` but not yet written.
    pub fn buffered_amount(&self, socket: SocketId) -> Option<usize> {
        self.sockets.get(&socket).map(Socket::buffered_amount)
    }

    /// Live sockets of `context`, in open order.
    pub fn sockets(&self, context: ContextId) -> Vec<SocketId> {
        self.contexts
            .get(context.as_raw())
            .map(|ctx| ctx.sockets.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }
}
