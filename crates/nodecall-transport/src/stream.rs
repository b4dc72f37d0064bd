use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A connected TCP stream, optionally wrapped in TLS.
///
/// This is the fundamental I/O type returned by transport operations. Both
/// accepted and dialed connections use it, so higher layers never need to
/// know which side performed the handshake.
pub struct NetStream {
    inner: NetStreamInner,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

enum NetStreamInner {
    Plain(TcpStream),
    TlsServer(Box<server::TlsStream<TcpStream>>),
    TlsClient(Box<client::TlsStream<TcpStream>>),
}

impl NetStream {
    pub(crate) fn plain(stream: TcpStream, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            inner: NetStreamInner::Plain(stream),
            peer_addr,
            local_addr,
        }
    }

    pub(crate) fn tls_server(
        stream: server::TlsStream<TcpStream>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            inner: NetStreamInner::TlsServer(Box::new(stream)),
            peer_addr,
            local_addr,
        }
    }

    pub(crate) fn tls_client(
        stream: client::TlsStream<TcpStream>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            inner: NetStreamInner::TlsClient(Box::new(stream)),
            peer_addr,
            local_addr,
        }
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self.inner, NetStreamInner::Plain(_))
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self.inner {
            NetStreamInner::Plain(_) => "tcp",
            NetStreamInner::TlsServer(_) | NetStreamInner::TlsClient(_) => "tls",
        }
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            NetStreamInner::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            NetStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            NetStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            NetStreamInner::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            NetStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            NetStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            NetStreamInner::Plain(stream) => Pin::new(stream).poll_flush(cx),
            NetStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            NetStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            NetStreamInner::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            NetStreamInner::TlsServer(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            NetStreamInner::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for NetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStream")
            .field("type", &self.transport_name())
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
