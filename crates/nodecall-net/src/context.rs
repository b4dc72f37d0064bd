use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use nodecall_frame::FrameConfig;
use nodecall_transport::{Listener, TlsConfig, TlsContext};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Result;
use crate::socket::{IoEvent, Origin, SocketId};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to a connection context within one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Handle to a listener within one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Configuration shared by every socket and listener of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// TLS material. `None` means plain TCP.
    pub tls: Option<TlsConfig>,
    pub frame: FrameConfig,
    /// Bound on TCP connect plus TLS handshake for outbound sockets.
    pub connect_timeout: Duration,
    /// Bound on the TLS handshake for inbound sockets.
    pub handshake_timeout: Duration,
    /// Close sockets that receive nothing for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            tls: None,
            frame: FrameConfig::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
        }
    }
}

pub(crate) struct ListenerEntry {
    pub(crate) local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerEntry {
    pub(crate) fn stop(self) {
        self.task.abort();
    }
}

/// A TLS/TCP configuration plus the sockets and listeners living under it.
pub(crate) struct Context {
    pub(crate) id: ContextId,
    pub(crate) config: ContextConfig,
    pub(crate) tls: Option<TlsContext>,
    pub(crate) sockets: BTreeSet<SocketId>,
    pub(crate) listeners: BTreeMap<ListenerId, ListenerEntry>,
}

impl Context {
    pub(crate) fn new(id: ContextId, config: ContextConfig) -> Result<Self> {
        let tls = config
            .tls
            .as_ref()
            .map(TlsContext::from_config)
            .transpose()?;
        Ok(Self {
            id,
            config,
            tls,
            sockets: BTreeSet::new(),
            listeners: BTreeMap::new(),
        })
    }

    /// Bind a listener and start its accept task.
    pub(crate) fn listen(
        &mut self,
        listener_id: ListenerId,
        host: &str,
        port: u16,
        io_tx: mpsc::UnboundedSender<IoEvent>,
    ) -> Result<SocketAddr> {
        let listener = Listener::bind(host, port, self.tls.as_ref())?;
        let local_addr = listener.local_addr();
        let task = tokio::spawn(accept_loop(
            listener,
            self.id,
            listener_id,
            self.config.handshake_timeout,
            io_tx,
        ));
        self.listeners
            .insert(listener_id, ListenerEntry { local_addr, task });
        Ok(local_addr)
    }

    /// Stop the listener on `port`, or every listener when `port` is `None`.
    pub(crate) fn stop_listening(&mut self, port: Option<u16>) -> usize {
        let ids: Vec<ListenerId> = self
            .listeners
            .iter()
            .filter(|(_, entry)| port.is_none_or(|port| entry.local_addr.port() == port))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = self.listeners.remove(id) {
                entry.stop();
            }
        }
        ids.len()
    }
}

async fn accept_loop(
    listener: Listener,
    context: ContextId,
    listener_id: ListenerId,
    handshake_timeout: Duration,
    io_tx: mpsc::UnboundedSender<IoEvent>,
) {
    loop {
        let incoming = match listener.accept().await {
            Ok(incoming) => incoming,
            Err(err) => {
                warn!(%context, listener = %listener_id, error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let tx = io_tx.clone();
        tokio::spawn(async move {
            let peer_addr = incoming.peer_addr();
            match incoming.handshake(handshake_timeout).await {
                Ok(stream) => {
                    let _ = tx.send(IoEvent::Opened {
                        context,
                        stream,
                        origin: Origin::Accepted {
                            listener: listener_id,
                        },
                    });
                }
                Err(err) => {
                    warn!(%context, %peer_addr, error = %err, "inbound handshake failed");
                }
            }
        });

        if io_tx.is_closed() {
            return;
        }
    }
}
