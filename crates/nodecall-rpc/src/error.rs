use std::time::Duration;

use nodecall_codec::CodecError;
use nodecall_net::NetError;

use crate::function::FunctionId;
use crate::node::NodeId;

/// Errors from registering or dispatching functions.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No function is bound to this ID.
    #[error("unknown function id {0}")]
    UnknownFunction(FunctionId),

    /// The function value was never registered.
    #[error("function is not registered")]
    NotRegistered,

    /// This function is already bound, under the given ID.
    #[error("function already registered as id {0}")]
    AlreadyRegistered(FunctionId),

    /// Capturing closures have no stable identity to look them up by.
    #[error("only fn items, fn pointers and non-capturing closures can be registered")]
    Unaddressable,

    /// Another function already owns this ID.
    #[error("function id {id} already used by {name:?}")]
    IdInUse { id: FunctionId, name: String },

    /// ID 0 and IDs with the reply bit set cannot be bound.
    #[error("function id {0:#x} is reserved")]
    ReservedId(u32),

    /// The arguments or the return value failed to encode or decode.
    #[error("codec error: {0}")]
    Decode(#[from] CodecError),
}

/// Errors from the RPC context.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Node 0 addresses every peer and cannot be added.
    #[error("node id {0} is reserved")]
    ReservedNode(NodeId),

    /// `run` or `async_run` was already called.
    #[error("context already started")]
    AlreadyStarted,

    /// The loop thread exited without answering.
    #[error("event loop is not running")]
    NotRunning,

    /// The loop thread panicked.
    #[error("event loop thread panicked")]
    LoopPanicked,

    /// A blocking request to the loop timed out.
    #[error("timed out after {0:?} waiting for the event loop")]
    Timeout(Duration),

    /// The loop thread could not be spawned.
    #[error("failed to spawn event loop thread: {0}")]
    Thread(std::io::Error),
}

/// Why a call never left this process, as reported to `on_send_failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    /// No node is registered under the target ID.
    #[error("unknown node")]
    UnknownNode,

    /// The node has neither a live socket nor a dial address.
    #[error("node has neither an address nor a connection")]
    NoAddress,

    /// The node never became reachable within the attempt bound.
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, RpcError>;
