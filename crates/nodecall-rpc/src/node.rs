use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

use nodecall_net::SocketId;
use tracing::debug;

/// Logical peer identifier. 0 addresses every connected peer.
pub type NodeId = u32;

/// The node ID that broadcasts a call.
pub const BROADCAST_NODE: NodeId = 0;

/// One peer as the repository knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    /// Dial address, when known.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Address of the live socket, if any.
    pub peer_addr: Option<SocketAddr>,
    pub socket: Option<SocketId>,
    /// An outbound connect for this node is in flight.
    pub connecting: bool,
}

impl Node {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            host: None,
            port: None,
            peer_addr: None,
            socket: None,
            connecting: false,
        }
    }

    fn matches_ip(&self, ip: IpAddr) -> bool {
        let known = self
            .host
            .as_deref()
            .and_then(|host| host.parse::<IpAddr>().ok())
            .or_else(|| self.peer_addr.map(|addr| addr.ip()));
        known == Some(ip)
    }
}

/// Where a call to a node should go right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Send on this socket.
    Socket(SocketId),
    /// A connect is in flight; try again later.
    Pending,
    /// No socket, but the address is known. The caller should dial it.
    Connect { host: String, port: u16 },
    /// The node exists with neither a socket nor an address.
    NoAddress,
    /// No such node.
    Unknown,
}

/// Maps node IDs to peers and sockets to node IDs.
///
/// Only the loop thread touches the repository.
#[derive(Debug, Default)]
pub struct NodeRepository {
    nodes: BTreeMap<NodeId, Node>,
    by_socket: HashMap<SocketId, NodeId>,
}

impl NodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node or update its dial address. A live socket is kept.
    pub fn add_node(&mut self, id: NodeId, host: impl Into<String>, port: u16) -> &Node {
        let node = self.nodes.entry(id).or_insert_with(|| Node::new(id));
        node.host = Some(host.into());
        node.port = Some(port);
        node
    }

    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        if let Some(socket) = node.socket {
            self.by_socket.remove(&socket);
        }
        Some(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_of(&self, socket: SocketId) -> Option<NodeId> {
        self.by_socket.get(&socket).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Attach a newly opened socket to a node and return the node's ID.
    ///
    /// An outbound socket tagged with a known node ID goes to that node.
    /// Otherwise the first node at the peer's IP without a live socket takes
    /// it, and failing that a fresh node is minted.
    pub fn on_open_socket(
        &mut self,
        socket: SocketId,
        peer_addr: SocketAddr,
        tag: Option<NodeId>,
    ) -> NodeId {
        let id = tag
            .filter(|id| *id != BROADCAST_NODE && self.nodes.contains_key(id))
            .or_else(|| {
                self.nodes
                    .values()
                    .find(|node| node.socket.is_none() && node.matches_ip(peer_addr.ip()))
                    .map(|node| node.id)
            })
            .unwrap_or_else(|| self.mint());

        let node = self.nodes.entry(id).or_insert_with(|| Node::new(id));
        if let Some(previous) = node.socket.replace(socket) {
            debug!(node = id, %previous, %socket, "node socket replaced");
        }
        node.peer_addr = Some(peer_addr);
        node.connecting = false;
        self.by_socket.insert(socket, id);
        id
    }

    /// Detach a closed socket. Returns the node it served.
    pub fn on_close_socket(&mut self, socket: SocketId) -> Option<NodeId> {
        let id = self.by_socket.remove(&socket)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            // A replacement socket may already serve the node.
            if node.socket == Some(socket) {
                node.socket = None;
                node.connecting = false;
            }
        }
        Some(id)
    }

    pub fn resolve(&self, id: NodeId) -> Route {
        let Some(node) = self.nodes.get(&id) else {
            return Route::Unknown;
        };
        if let Some(socket) = node.socket {
            return Route::Socket(socket);
        }
        if node.connecting {
            return Route::Pending;
        }
        match (&node.host, node.port) {
            (Some(host), Some(port)) => Route::Connect {
                host: host.clone(),
                port,
            },
            _ => Route::NoAddress,
        }
    }

    /// Mark a connect as in flight so concurrent calls wait instead of
    /// dialing again.
    pub fn begin_connect(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.connecting = true;
        }
    }

    pub fn connect_failed(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.connecting = false;
        }
    }

    /// Minted IDs continue above the highest known ID. Once `NodeId::MAX` is
    /// taken, the lowest free ID is used instead.
    fn mint(&self) -> NodeId {
        let above = self
            .nodes
            .keys()
            .next_back()
            .map_or(Some(1), |highest| highest.checked_add(1));
        if let Some(id) = above {
            return id;
        }

        let mut candidate = 1;
        for id in self.nodes.keys().copied().filter(|id| *id != BROADCAST_NODE) {
            if id != candidate {
                break;
            }
            candidate = id.saturating_add(1);
        }
        candidate
    }
}
