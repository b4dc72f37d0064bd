use std::fmt;
use std::net::SocketAddr;

use nodecall_codec::Buffer;
use nodecall_frame::FrameError;
use nodecall_transport::TransportError;

use crate::context::{ContextId, ListenerId};
use crate::event_loop::Net;
use crate::socket::SocketId;

/// Framed-message callbacks invoked on the loop thread.
///
/// Every method receives the loop state so handlers can send, close, connect
/// or defer work inline without going through the queue. Only
/// [`Handler::on_message`] is required.
pub trait Handler: Sized + Send + 'static {
    /// A connection finished its handshake and is ready for traffic.
    fn on_open(&mut self, net: &mut Net<Self>, info: &OpenInfo) {
        let _ = (net, info);
    }

    /// One complete frame arrived.
    fn on_message(&mut self, net: &mut Net<Self>, socket: SocketId, message: Buffer);

    /// The socket is gone; its ID will never be reused.
    fn on_close(&mut self, net: &mut Net<Self>, socket: SocketId, reason: &CloseReason) {
        let _ = (net, socket, reason);
    }

    /// The peer finished sending. The socket closes right after.
    fn on_end(&mut self, net: &mut Net<Self>, socket: SocketId) {
        let _ = (net, socket);
    }

    /// No data arrived within the context's idle timeout. The socket closes
    /// right after.
    fn on_timeout(&mut self, net: &mut Net<Self>, socket: SocketId) {
        let _ = (net, socket);
    }

    /// The socket's write backlog drained after exceeding the high-water mark.
    fn on_writable(&mut self, net: &mut Net<Self>, socket: SocketId) {
        let _ = (net, socket);
    }

    /// An outbound connect failed or timed out.
    fn on_connect_failed(&mut self, net: &mut Net<Self>, failure: &ConnectFailure) {
        let _ = (net, failure);
    }
}

/// Details about a newly opened socket.
#[derive(Debug, Clone)]
pub struct OpenInfo {
    pub socket: SocketId,
    pub context: ContextId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// Whether this side dialed the connection.
    pub is_client: bool,
    /// Tag passed to the connect that produced this socket.
    pub tag: Option<u64>,
    /// Listener that accepted this socket.
    pub listener: Option<ListenerId>,
    pub tls: bool,
}

/// A connect attempt that never produced a socket.
#[derive(Debug)]
pub struct ConnectFailure {
    pub context: ContextId,
    pub host: String,
    pub port: u16,
    pub tag: Option<u64>,
    pub error: TransportError,
}

/// Why a socket closed.
#[derive(Debug)]
pub enum CloseReason {
    /// Closed locally on request.
    Local,
    /// The peer ended the stream.
    PeerClosed,
    /// Idle timeout.
    Timeout,
    /// The peer violated the framing protocol.
    Protocol(FrameError),
    Io(std::io::Error),
    /// The loop is stopping.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::Timeout => f.write_str("idle timeout"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Shutdown => f.write_str("loop shutdown"),
        }
    }
}
