use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use nodecall_codec::{Buffer, Encode, Reader, Writer};
use nodecall_frame::encode_header;
use nodecall_net::{
    CloseReason, ConnectFailure, ContextId, Event, EventOutcome, Handler, Loop, LoopHandle,
    LoopState, Net, NetError, OpenInfo, Queued, SocketId,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError, SendFailure};
use crate::function::{RemoteFn, REPLY_FLAG, REPLY_ID};
use crate::node::{Node, NodeId, NodeRepository, Route, BROADCAST_NODE};
use crate::registry::FunctionRegistry;

pub type OpenCallback = Box<dyn FnMut(&PeerInfo) + Send>;
pub type CloseCallback = Box<dyn FnMut(&PeerInfo) + Send>;
pub type SendFailedCallback = Box<dyn FnMut(NodeId, &SendFailure) + Send>;
pub type ReplyCallback = Box<dyn FnMut(NodeId, Buffer) + Send>;

/// A live connection as seen by application callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub node: NodeId,
    /// Random non-zero ID for diagnostics only.
    pub connection: u32,
    pub socket: SocketId,
    pub peer_addr: SocketAddr,
    pub is_client: bool,
}

/// Counters kept by the loop thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcStats {
    /// Calls written to a socket.
    pub calls_sent: u64,
    /// Sockets reached by broadcast calls.
    pub broadcast_sends: u64,
    /// Connects started on behalf of calls.
    pub connects: u64,
    /// Incoming calls that ran.
    pub dispatched: u64,
    /// Incoming frames that could not be dispatched.
    pub dispatch_errors: u64,
    pub replies_sent: u64,
    pub replies_received: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct Callbacks {
    on_open: Option<OpenCallback>,
    on_close: Option<CloseCallback>,
    on_send_failed: Option<SendFailedCallback>,
    on_reply: Option<ReplyCallback>,
}

/// Loop-thread half of an [`RpcContext`]: routes calls to nodes and
/// dispatches incoming frames to the function registry.
pub struct RpcState {
    registry: Arc<FunctionRegistry>,
    nodes: NodeRepository,
    connections: HashMap<SocketId, PeerInfo>,
    context: ContextId,
    retry_defer: u32,
    max_send_attempts: u32,
    callbacks: Callbacks,
    stats: RpcStats,
}

impl RpcState {
    fn new(registry: Arc<FunctionRegistry>, config: &RpcConfig) -> Self {
        Self {
            registry,
            nodes: NodeRepository::new(),
            connections: HashMap::new(),
            context: ContextId::from_raw(0),
            retry_defer: config.retry_defer,
            max_send_attempts: config.max_send_attempts,
            callbacks: Callbacks::default(),
            stats: RpcStats::default(),
        }
    }

    pub fn nodes(&self) -> &NodeRepository {
        &self.nodes
    }

    pub fn stats(&self) -> RpcStats {
        self.stats
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Live connections, keyed by socket.
    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.connections.values()
    }

    fn new_connection_id(&self) -> u32 {
        loop {
            let id = rand::random::<u32>();
            if id != 0 && !self.connections.values().any(|peer| peer.connection == id) {
                return id;
            }
        }
    }

    /// Route one call attempt. Runs on the loop thread.
    fn send_to(&mut self, net: &mut Net<Self>, node: NodeId, payload: Bytes, attempt: u32) {
        if node == BROADCAST_NODE {
            let mut reached = 0;
            for socket in net.sockets(self.context) {
                match net.send_bytes(socket, payload.clone()) {
                    Ok(()) => reached += 1,
                    Err(err) => debug!(%socket, error = %err, "broadcast skipped socket"),
                }
            }
            self.stats.broadcast_sends += reached;
            debug!(reached, len = payload.len(), "call broadcast");
            return;
        }

        match self.nodes.resolve(node) {
            Route::Socket(socket) => match net.send_bytes(socket, payload.clone()) {
                Ok(()) => {
                    self.stats.calls_sent += 1;
                    debug!(node, %socket, len = payload.len(), attempt, "call sent");
                }
                Err(err) => {
                    debug!(node, %socket, error = %err, "send failed, retrying");
                    self.retry(net, node, payload, attempt);
                }
            },
            Route::Pending => self.retry(net, node, payload, attempt),
            Route::Connect { host, port } => {
                self.nodes.begin_connect(node);
                self.stats.connects += 1;
                info!(node, %host, port, "connecting to node");
                if let Err(err) = net.connect(self.context, &host, port, Some(u64::from(node))) {
                    error!(node, %host, port, error = %err, "could not start connect");
                    self.nodes.connect_failed(node);
                }
                self.retry(net, node, payload, attempt);
            }
            Route::NoAddress => {
                error!(node, "node has neither an address nor a connection");
                self.fail(node, SendFailure::NoAddress);
            }
            Route::Unknown => {
                error!(node, "call to unknown node");
                self.fail(node, SendFailure::UnknownNode);
            }
        }
    }

    fn retry(&mut self, net: &mut Net<Self>, node: NodeId, payload: Bytes, attempt: u32) {
        let attempts = attempt + 1;
        if attempts >= self.max_send_attempts {
            error!(node, attempts, "giving up on call");
            self.fail(node, SendFailure::RetriesExhausted { attempts });
            return;
        }
        net.defer(
            self.retry_defer,
            Event::Custom(Box::new(
                move |state: &mut RpcState, net: &mut Net<RpcState>| {
                    state.send_to(net, node, payload, attempts);
                },
            )),
        );
    }

    fn fail(&mut self, node: NodeId, failure: SendFailure) {
        self.stats.send_failures += 1;
        if let Some(on_send_failed) = self.callbacks.on_send_failed.as_mut() {
            on_send_failed(node, &failure);
        }
    }

    fn dispatch(&mut self, net: &mut Net<Self>, socket: SocketId, reader: &mut Reader<'_>, raw: u32) {
        if raw & REPLY_FLAG == 0 {
            match self.registry.invoke(raw, reader) {
                Ok(()) => {
                    self.stats.dispatched += 1;
                    debug!(%socket, function = raw, "call dispatched");
                }
                Err(err) => {
                    self.stats.dispatch_errors += 1;
                    warn!(%socket, function = raw, error = %err, "dispatch failed");
                }
            }
            return;
        }

        let function = raw & !REPLY_FLAG;
        let mut writer = Writer::new();
        writer.write(&REPLY_ID);
        let reply = self
            .registry
            .invoke_with_return(function, reader, &mut writer)
            .map_err(RpcError::from)
            .and_then(|()| writer.finish().map_err(RpcError::from));
        match reply {
            Ok(reply) => {
                self.stats.dispatched += 1;
                match net.send(socket, reply) {
                    Ok(()) => self.stats.replies_sent += 1,
                    Err(err) => warn!(%socket, function, error = %err, "reply not sent"),
                }
            }
            Err(err) => {
                self.stats.dispatch_errors += 1;
                warn!(%socket, function, error = %err, "dispatch failed");
            }
        }
    }
}

impl Handler for RpcState {
    fn on_open(&mut self, _net: &mut Net<Self>, info: &OpenInfo) {
        let tag = info.tag.and_then(|tag| NodeId::try_from(tag).ok());
        let node = self.nodes.on_open_socket(info.socket, info.peer_addr, tag);
        let peer = PeerInfo {
            node,
            connection: self.new_connection_id(),
            socket: info.socket,
            peer_addr: info.peer_addr,
            is_client: info.is_client,
        };
        info!(
            node,
            connection = peer.connection,
            socket = %info.socket,
            peer = %info.peer_addr,
            "node connected"
        );
        if let Some(on_open) = self.callbacks.on_open.as_mut() {
            on_open(&peer);
        }
        self.connections.insert(info.socket, peer);
    }

    fn on_message(&mut self, net: &mut Net<Self>, socket: SocketId, message: Buffer) {
        let mut reader = Reader::from_buffer(&message);
        let raw = match reader.read::<u32>() {
            Ok(raw) => raw,
            Err(err) => {
                self.stats.dispatch_errors += 1;
                warn!(%socket, error = %err, "frame too short for a function id");
                return;
            }
        };

        if raw == REPLY_ID {
            self.stats.replies_received += 1;
            let node = self.nodes.node_of(socket).unwrap_or(BROADCAST_NODE);
            let value = Buffer::from(reader.rest());
            match self.callbacks.on_reply.as_mut() {
                Some(on_reply) => on_reply(node, value),
                None => debug!(node, %socket, "reply dropped, no reply callback"),
            }
            return;
        }

        self.dispatch(net, socket, &mut reader, raw);
    }

    fn on_close(&mut self, _net: &mut Net<Self>, socket: SocketId, reason: &CloseReason) {
        self.nodes.on_close_socket(socket);
        let Some(peer) = self.connections.remove(&socket) else {
            return;
        };
        info!(
            node = peer.node,
            connection = peer.connection,
            %socket,
            %reason,
            "node disconnected"
        );
        if let Some(on_close) = self.callbacks.on_close.as_mut() {
            on_close(&peer);
        }
    }

    fn on_connect_failed(&mut self, _net: &mut Net<Self>, failure: &ConnectFailure) {
        if let Some(node) = failure.tag.and_then(|tag| NodeId::try_from(tag).ok()) {
            debug!(node, "connect failed, node will be retried");
            self.nodes.connect_failed(node);
        }
    }
}

/// Thread-safe entry point: calls remote functions by node ID and serves
/// incoming calls from a [`FunctionRegistry`].
///
/// Every method only queues work for the loop, so all of them may be called
/// from any thread, before or after the loop starts. Work queued before
/// [`RpcContext::run`] or [`RpcContext::async_run`] runs first, in order.
pub struct RpcContext {
    handle: LoopHandle<RpcState>,
    context: ContextId,
    registry: Arc<FunctionRegistry>,
    max_frame_size: usize,
    start_timeout: Duration,
    query_timeout: Duration,
    pending: Mutex<Option<Loop<RpcState>>>,
    thread: Mutex<Option<JoinHandle<nodecall_net::Result<RpcState>>>>,
}

impl RpcContext {
    /// A context serving the process-wide registry.
    pub fn new(config: RpcConfig) -> Result<Self> {
        Self::with_registry(config, FunctionRegistry::global())
    }

    pub fn with_registry(config: RpcConfig, registry: Arc<FunctionRegistry>) -> Result<Self> {
        let state = RpcState::new(Arc::clone(&registry), &config);
        let RpcConfig {
            context,
            event_loop,
            start_timeout,
            query_timeout,
            ..
        } = config;
        let max_frame_size = context.frame.max_frame_size;

        let mut event_loop = Loop::with_config(state, event_loop);
        let context = event_loop.add_context(context)?;
        event_loop.handler_mut().context = context;

        Ok(Self {
            handle: event_loop.handle(),
            context,
            registry,
            max_frame_size,
            start_timeout,
            query_timeout,
            pending: Mutex::new(Some(event_loop)),
            thread: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn handle(&self) -> &LoopHandle<RpcState> {
        &self.handle
    }

    pub fn state(&self) -> LoopState {
        self.handle.state()
    }

    fn custom<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RpcState, &mut Net<RpcState>) + Send + 'static,
    {
        self.handle.custom(f)?;
        Ok(())
    }

    pub fn listen(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let queued = Queued::new(Event::ListenStart {
            context: self.context,
            host: host.into(),
            port,
        })
        .then(|_, _, outcome| {
            if let EventOutcome::Listening { addr, .. } = outcome {
                info!(%addr, "listening");
            }
        });
        self.handle.push_queued(queued)?;
        Ok(())
    }

    /// Bind a listener and wait up to `timeout` for the bound address.
    /// The loop must be running.
    pub fn listen_and_wait(
        &self,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Result<SocketAddr> {
        let (tx, rx) = mpsc::channel();
        let queued = Queued::new(Event::ListenStart {
            context: self.context,
            host: host.into(),
            port,
        })
        .then(move |_, _, outcome| {
            let _ = tx.send(outcome);
        });
        self.handle.push_queued(queued)?;

        match rx.recv_timeout(timeout) {
            Ok(EventOutcome::Listening { addr, .. }) => {
                info!(%addr, "listening");
                Ok(addr)
            }
            Ok(EventOutcome::Failed(err)) => Err(err.into()),
            Ok(_) | Err(RecvTimeoutError::Disconnected) => Err(RpcError::NotRunning),
            Err(RecvTimeoutError::Timeout) => Err(RpcError::Timeout(timeout)),
        }
    }

    /// Dial a peer without a node ID. The socket is attached to a node by IP
    /// when it opens.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> Result<()> {
        self.handle.connect(self.context, host, port, None)?;
        Ok(())
    }

    /// Register or re-address a node.
    pub fn add_node(&self, node: NodeId, host: impl Into<String>, port: u16) -> Result<()> {
        if node == BROADCAST_NODE {
            return Err(RpcError::ReservedNode(node));
        }
        let host = host.into();
        self.custom(move |state, _| {
            debug!(node, %host, port, "node added");
            state.nodes.add_node(node, host, port);
        })
    }

    /// Close the node's socket. Later calls reconnect.
    pub fn disconnect(&self, node: NodeId) -> Result<()> {
        self.custom(move |state, net| {
            match state.nodes.get(node).and_then(|entry| entry.socket) {
                Some(socket) => {
                    net.close(socket);
                }
                None => debug!(node, "disconnect ignored, node has no socket"),
            }
        })
    }

    /// Send an encoded payload to `node`, or to every live socket when
    /// `node` is 0.
    ///
    /// A node with a known address but no socket is dialed and the call is
    /// retried until the socket opens or the attempt bound runs out.
    pub fn call(&self, node: NodeId, payload: Buffer) -> Result<()> {
        encode_header(payload.len(), self.max_frame_size).map_err(NetError::from)?;
        let payload = payload.freeze();
        self.custom(move |state, net| state.send_to(net, node, payload, 0))
    }

    /// Encode a call to the registered function `f` and send it.
    pub fn call_fn<F, Args>(&self, node: NodeId, f: &F, args: Args) -> Result<()>
    where
        F: RemoteFn<Args>,
        Args: Encode,
    {
        let payload = self.registry.prepare_call(f, args)?.finish()?;
        self.call(node, payload)
    }

    /// Like [`RpcContext::call_fn`], asking the callee to send the return
    /// value back to the `on_reply` callback.
    pub fn call_with_reply<F, Args>(&self, node: NodeId, f: &F, args: Args) -> Result<()>
    where
        F: RemoteFn<Args>,
        Args: Encode,
    {
        let payload = self.registry.prepare_call_with_reply(f, args)?.finish()?;
        self.call(node, payload)
    }

    pub fn on_open<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&PeerInfo) + Send + 'static,
    {
        self.custom(move |state, _| state.callbacks.on_open = Some(Box::new(f)))
    }

    pub fn on_close<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&PeerInfo) + Send + 'static,
    {
        self.custom(move |state, _| state.callbacks.on_close = Some(Box::new(f)))
    }

    pub fn on_send_failed<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(NodeId, &SendFailure) + Send + 'static,
    {
        self.custom(move |state, _| state.callbacks.on_send_failed = Some(Box::new(f)))
    }

    /// Receives the node ID and the encoded return value of each reply.
    pub fn on_reply<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(NodeId, Buffer) + Send + 'static,
    {
        self.custom(move |state, _| state.callbacks.on_reply = Some(Box::new(f)))
    }

    /// Run `f` against the loop state and wait for its result.
    pub fn query<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&RpcState) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.custom(move |state, _| {
            let _ = tx.send(f(state));
        })?;
        rx.recv_timeout(self.query_timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RpcError::Timeout(self.query_timeout),
            RecvTimeoutError::Disconnected => RpcError::NotRunning,
        })
    }

    pub fn stats(&self) -> Result<RpcStats> {
        self.query(RpcState::stats)
    }

    pub fn node(&self, node: NodeId) -> Result<Option<Node>> {
        self.query(move |state| state.nodes.get(node).cloned())
    }

    /// Run the loop on the calling thread until [`RpcContext::shutdown`].
    pub fn run(&self) -> Result<RpcStats> {
        let event_loop = self.pending.lock().take().ok_or(RpcError::AlreadyStarted)?;
        let state = event_loop.run()?;
        Ok(state.stats)
    }

    /// Start the loop on a background thread. Returns once the loop has
    /// executed everything queued before this call, or after
    /// `start_timeout` if it is still busy. The loop keeps running either way.
    pub fn async_run(&self) -> Result<()> {
        let event_loop = self.pending.lock().take().ok_or(RpcError::AlreadyStarted)?;
        let (tx, rx) = mpsc::channel();
        self.custom(move |_, _| {
            let _ = tx.send(());
        })?;

        let thread = thread::Builder::new()
            .name("nodecall-loop".to_string())
            .spawn(move || event_loop.run())
            .map_err(RpcError::Thread)?;
        *self.thread.lock() = Some(thread);

        match rx.recv_timeout(self.start_timeout) {
            Ok(()) => {
                debug!("event loop started");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.start_timeout, "event loop slow to start, continuing");
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::NotRunning),
        }
    }

    /// Ask the loop to drain and stop. Does not wait.
    pub fn shutdown(&self) -> Result<()> {
        match self.handle.stop() {
            Ok(()) | Err(NetError::LoopClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Wait for a loop started by [`RpcContext::async_run`] to stop.
    pub fn wait(&self) -> Result<RpcStats> {
        let thread = self.thread.lock().take().ok_or(RpcError::NotRunning)?;
        let state = thread.join().map_err(|_| RpcError::LoopPanicked)??;
        Ok(state.stats)
    }
}

impl Drop for RpcContext {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.get_mut().take() {
            let _ = self.handle.stop();
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("context", &self.context)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
