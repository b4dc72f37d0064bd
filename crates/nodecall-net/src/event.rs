use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nodecall_codec::Buffer;
use tokio::sync::mpsc;

use crate::context::{ContextId, ListenerId};
use crate::error::{NetError, Result};
use crate::event_loop::Net;
use crate::socket::SocketId;

/// Action run on the loop thread with access to the handler and loop state.
pub type CustomFn<H> = Box<dyn FnOnce(&mut H, &mut Net<H>) + Send>;

/// Callback run after an event's primary action, observing its outcome.
pub type AfterFn<H> = Box<dyn FnOnce(&mut H, &mut Net<H>, EventOutcome) + Send>;

/// One deferred action for the loop.
pub enum Event<H> {
    /// Bind a listener under a context.
    ListenStart {
        context: ContextId,
        host: String,
        port: u16,
    },
    /// Stop the context's listener on `port`, or all of them.
    ListenStop {
        context: ContextId,
        port: Option<u16>,
    },
    /// Dial a peer. `tag` is echoed back in the open or failure notification.
    Connect {
        context: ContextId,
        host: String,
        port: u16,
        tag: Option<u64>,
    },
    CloseSocket {
        socket: SocketId,
    },
    /// Frame and write a payload on one socket.
    Send {
        socket: SocketId,
        payload: Buffer,
    },
    /// Write a payload to every socket of a context.
    BroadcastContext {
        context: ContextId,
        payload: Buffer,
    },
    /// Write a payload to every socket of the loop.
    BroadcastLoop {
        payload: Buffer,
    },
    Custom(CustomFn<H>),
    /// Drain and stop the loop.
    Stop,
}

impl<H> Event<H> {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListenStart { .. } => "listen_start",
            Self::ListenStop { .. } => "listen_stop",
            Self::Connect { .. } => "connect",
            Self::CloseSocket { .. } => "close_socket",
            Self::Send { .. } => "send",
            Self::BroadcastContext { .. } => "broadcast_context",
            Self::BroadcastLoop { .. } => "broadcast_loop",
            Self::Custom(_) => "custom",
            Self::Stop => "stop",
        }
    }
}

impl<H> std::fmt::Debug for Event<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Event").field(&self.kind()).finish()
    }
}

/// What happened to an event, as seen by its `after` callback.
#[derive(Debug)]
pub enum EventOutcome {
    /// The primary action ran. For `Connect` this means the attempt started.
    Completed,
    /// A listener is bound.
    Listening {
        listener: ListenerId,
        addr: SocketAddr,
    },
    /// A broadcast reached this many sockets.
    Broadcast(usize),
    /// The primary action failed.
    Failed(NetError),
    /// The loop stopped before the event ran.
    Dropped,
}

impl EventOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_) | Self::Dropped)
    }
}

/// An event in the queue with its defer counter and optional continuation.
pub struct Queued<H> {
    pub event: Event<H>,
    /// Remaining drain passes before the event executes.
    pub defer: u32,
    pub after: Option<AfterFn<H>>,
}

impl<H> Queued<H> {
    pub fn new(event: Event<H>) -> Self {
        Self {
            event,
            defer: 0,
            after: None,
        }
    }

    pub fn deferred(mut self, defer: u32) -> Self {
        self.defer = defer;
        self
    }

    pub fn then<F>(mut self, after: F) -> Self
    where
        F: FnOnce(&mut H, &mut Net<H>, EventOutcome) + Send + 'static,
    {
        self.after = Some(Box::new(after));
        self
    }
}

/// Lifecycle of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Cloneable, thread-safe handle for pushing events into a loop.
///
/// Pushing also wakes the loop. Events pushed before the loop runs are held
/// until it starts.
pub struct LoopHandle<H> {
    tx: mpsc::UnboundedSender<Queued<H>>,
    state: Arc<SharedState>,
}

impl<H> Clone for LoopHandle<H> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<H> LoopHandle<H> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Queued<H>>, state: Arc<SharedState>) -> Self {
        Self { tx, state }
    }

    /// Enqueue a fully specified event.
    pub fn push_queued(&self, queued: Queued<H>) -> Result<()> {
        if self.state.get() == LoopState::Stopped {
            return Err(NetError::LoopClosed);
        }
        self.tx.send(queued).map_err(|_| NetError::LoopClosed)
    }

    pub fn push(&self, event: Event<H>) -> Result<()> {
        self.push_queued(Queued::new(event))
    }

    /// Enqueue an event that executes after `defer` drain passes.
    pub fn push_deferred(&self, event: Event<H>, defer: u32) -> Result<()> {
        self.push_queued(Queued::new(event).deferred(defer))
    }

    pub fn send(&self, socket: SocketId, payload: Buffer) -> Result<()> {
        self.push(Event::Send { socket, payload })
    }

    pub fn close(&self, socket: SocketId) -> Result<()> {
        self.push(Event::CloseSocket { socket })
    }

    pub fn listen(&self, context: ContextId, host: impl Into<String>, port: u16) -> Result<()> {
        self.push(Event::ListenStart {
            context,
            host: host.into(),
            port,
        })
    }

    pub fn connect(
        &self,
        context: ContextId,
        host: impl Into<String>,
        port: u16,
        tag: Option<u64>,
    ) -> Result<()> {
        self.push(Event::Connect {
            context,
            host: host.into(),
            port,
            tag,
        })
    }

    /// Run `f` on the loop thread.
    pub fn custom<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut H, &mut Net<H>) + Send + 'static,
    {
        self.push(Event::Custom(Box::new(f)))
    }

    /// Ask the loop to drain and stop.
    pub fn stop(&self) -> Result<()> {
        self.push(Event::Stop)
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }
}

impl<H> std::fmt::Debug for LoopHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[test]
    fn test_state_roundtrip() {
        let state = SharedState::default();
        assert_eq!(state.get(), LoopState::Created);
        for next in [LoopState::Running, LoopState::Draining, LoopState::Stopped] {
            state.set(next);
            assert_eq!(state.get(), next);
        }
    }

    #[test]
    fn test_push_after_stop_fails() {
        let (tx, _rx) = mpsc::unbounded_channel::<Queued<Nothing>>();
        let state = Arc::new(SharedState::default());
        let handle = LoopHandle::new(tx, Arc::clone(&state));
        assert!(handle.push(Event::Stop).is_ok());

        state.set(LoopState::Stopped);
        assert!(matches!(handle.push(Event::Stop), Err(NetError::LoopClosed)));
    }

    #[test]
    fn test_push_after_receiver_dropped_fails() {
        let (tx, rx) = mpsc::unbounded_channel::<Queued<Nothing>>();
        let handle = LoopHandle::new(tx, Arc::new(SharedState::default()));
        drop(rx);
        assert!(matches!(
            handle.send(SocketId::from_raw(1), Buffer::new()),
            Err(NetError::LoopClosed)
        ));
    }

    #[test]
    fn test_queued_builder() {
        let queued = Queued::<Nothing>::new(Event::Stop)
            .deferred(3)
            .then(|_, _, _| {});
        assert_eq!(queued.defer, 3);
        assert!(queued.after.is_some());
        assert_eq!(queued.event.kind(), "stop");
    }
}
