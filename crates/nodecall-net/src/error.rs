use nodecall_frame::FrameError;
use nodecall_transport::TransportError;

use crate::context::ContextId;
use crate::socket::SocketId;

/// Errors that can occur in the event loop and connection layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// `Loop::run` was called on a thread that is already running a loop.
    #[error("an event loop is already running on this thread")]
    LoopAlreadyRunning,

    /// The loop has stopped and no longer accepts events.
    #[error("event loop is closed")]
    LoopClosed,

    /// No context is registered under this ID.
    #[error("unknown context {0}")]
    UnknownContext(ContextId),

    /// The socket is closed or never existed.
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),

    /// The runtime backing the loop could not be created.
    #[error("failed to start runtime: {0}")]
    Runtime(std::io::Error),

    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, NetError>;
