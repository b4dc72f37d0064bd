//! Remote function calls between nodecall peers.
//!
//! A [`FunctionRegistry`] binds native Rust functions to numeric IDs. A call
//! is a frame holding the ID and the encoded argument tuple:
//!
//! ```text
//! [u32 LE function id][encoded arguments]
//! ```
//!
//! The ID's high bit ([`REPLY_FLAG`]) asks the callee to send the return
//! value back as `[u32 LE 0][encoded value]`.
//!
//! [`RpcContext`] addresses peers by logical node ID. The [`NodeRepository`]
//! maps node IDs to sockets; calls to a node that is known but not connected
//! start a connect and are retried until the socket opens.
//!
//! ```no_run
//! use nodecall_rpc::{FunctionRegistry, RpcConfig, RpcContext};
//!
//! fn add(a: i64, b: i64) -> i64 {
//!     a + b
//! }
//!
//! let registry = FunctionRegistry::global();
//! registry.register("add", add)?;
//!
//! let ctx = RpcContext::new(RpcConfig::default())?;
//! ctx.add_node(2, "127.0.0.1", 7100)?;
//! ctx.async_run()?;
//! ctx.call_fn(2, &add, (1i64, 2i64))?;
//! # Ok::<(), nodecall_rpc::RpcError>(())
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod function;
pub mod node;
pub mod registry;

pub use config::RpcConfig;
pub use context::{PeerInfo, RpcContext, RpcState, RpcStats};
pub use error::{RegistryError, Result, RpcError, SendFailure};
pub use function::{FunctionEntry, FunctionId, RemoteFn, REPLY_FLAG, REPLY_ID};
pub use node::{Node, NodeId, NodeRepository, Route, BROADCAST_NODE};
pub use registry::FunctionRegistry;

pub use nodecall_net::{ContextConfig, LoopConfig, LoopState};
pub use nodecall_transport::TlsConfig;
