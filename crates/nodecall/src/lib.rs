//! Call functions on remote peers by logical node ID.
//!
//! nodecall sends length-prefixed binary frames over TCP or TLS, driven by a
//! single-threaded event loop. Functions are registered once per process and
//! addressed by numeric ID; peers are addressed by node ID and connected on
//! demand.
//!
//! # Crate Structure
//!
//! - [`codec`]: pooled buffers and the tagless binary codec
//! - [`frame`]: 4-byte length framing and stream reassembly
//! - [`transport`]: TCP and TLS streams, listeners and certificate loading
//! - [`net`]: the event loop, connection contexts and sockets
//! - [`rpc`]: function registry, node repository and the RPC context
//!
//! The most used types are re-exported at the crate root.

/// Re-export codec types.
pub mod codec {
    pub use nodecall_codec::*;
}

/// Re-export frame types.
pub mod frame {
    pub use nodecall_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use nodecall_transport::*;
}

/// Re-export event loop types.
pub mod net {
    pub use nodecall_net::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use nodecall_rpc::*;
}

pub use nodecall_codec::{Buffer, Decode, Encode, Reader, Writer};
pub use nodecall_rpc::{
    FunctionRegistry, NodeId, PeerInfo, RpcConfig, RpcContext, RpcError, RpcStats, SendFailure,
    TlsConfig,
};
