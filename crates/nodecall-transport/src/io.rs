use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::NetStream;
use crate::tls::TlsContext;

/// Dial `host:port`, performing a TLS handshake when `tls` is given.
///
/// The TCP connect and the handshake together must finish within `timeout`.
pub async fn connect(
    host: &str,
    port: u16,
    tls: Option<&TlsContext>,
    timeout: Duration,
) -> Result<NetStream> {
    let addr = format!("{host}:{port}");
    tokio::time::timeout(timeout, dial(host, port, &addr, tls))
        .await
        .map_err(|_| TransportError::Timeout {
            addr: addr.clone(),
            after: timeout,
        })?
}

async fn dial(host: &str, port: u16, addr: &str, tls: Option<&TlsContext>) -> Result<NetStream> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    tcp.set_nodelay(true)?;
    let peer_addr = tcp.peer_addr()?;
    let local_addr = tcp.local_addr()?;

    let stream = match tls {
        Some(tls) => {
            let name = tls.server_name_for(host)?;
            let stream = tls.connector().connect(name, tcp).await.map_err(|source| {
                TransportError::Handshake {
                    addr: addr.to_string(),
                    source,
                }
            })?;
            NetStream::tls_client(stream, peer_addr, local_addr)
        }
        None => NetStream::plain(tcp, peer_addr, local_addr),
    };

    debug!(%peer_addr, transport = stream.transport_name(), "connected");
    Ok(stream)
}

/// A bound TCP listener with an optional TLS acceptor.
pub struct Listener {
    inner: TcpListener,
    acceptor: Option<TlsAcceptor>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind and listen on `host:port`. Port 0 picks a free port.
    ///
    /// Binding completes synchronously so callers learn the bound address
    /// immediately; it must be called from within a tokio runtime.
    pub fn bind(host: &str, port: u16, tls: Option<&TlsContext>) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let bind_error = |source| TransportError::Bind {
            addr: addr.clone(),
            source,
        };
        let std_listener = std::net::TcpListener::bind((host, port)).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let inner = TcpListener::from_std(std_listener).map_err(bind_error)?;
        let local_addr = inner.local_addr()?;

        info!(%local_addr, tls = tls.is_some(), "listening");

        Ok(Self {
            inner,
            acceptor: tls.map(TlsContext::acceptor),
            local_addr,
        })
    }

    /// Accept the next TCP connection. The TLS handshake, if any, is left to
    /// [`Incoming::handshake`] so a slow peer does not stall the accept loop.
    pub async fn accept(&self) -> Result<Incoming> {
        let (tcp, peer_addr) = self.inner.accept().await.map_err(TransportError::Accept)?;
        tcp.set_nodelay(true)?;
        debug!(%peer_addr, "accepted connection");
        Ok(Incoming {
            tcp,
            peer_addr,
            local_addr: self.local_addr,
            acceptor: self.acceptor.clone(),
        })
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.acceptor.is_some())
            .finish()
    }
}

/// An accepted TCP connection awaiting its handshake.
pub struct Incoming {
    tcp: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Complete the TLS handshake (a no-op for plain TCP) within `timeout`.
    pub async fn handshake(self, timeout: Duration) -> Result<NetStream> {
        let Self {
            tcp,
            peer_addr,
            local_addr,
            acceptor,
        } = self;

        let Some(acceptor) = acceptor else {
            return Ok(NetStream::plain(tcp, peer_addr, local_addr));
        };

        let addr = peer_addr.to_string();
        let stream = tokio::time::timeout(timeout, acceptor.accept(tcp))
            .await
            .map_err(|_| TransportError::Timeout {
                addr: addr.clone(),
                after: timeout,
            })?
            .map_err(|source| TransportError::Handshake { addr, source })?;
        Ok(NetStream::tls_server(stream, peer_addr, local_addr))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_plain_roundtrip() {
        let listener = Listener::bind("127.0.0.1", 0, None).unwrap();
        let port = listener.local_addr().port();

        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            let mut stream = incoming.handshake(Duration::from_secs(5)).await.unwrap();
            assert!(!stream.is_tls());
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = connect("127.0.0.1", port, None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.peer_addr().port(), port);
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port with nothing listening.
        let port = {
            let listener = Listener::bind("127.0.0.1", 0, None).unwrap();
            listener.local_addr().port()
        };
        let result = connect("127.0.0.1", port, None, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        let first = Listener::bind("127.0.0.1", 0, None).unwrap();
        let port = first.local_addr().port();
        let second = Listener::bind("127.0.0.1", port, None);
        assert!(matches!(second, Err(TransportError::Bind { .. })));
    }
}
