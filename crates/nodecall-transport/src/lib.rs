//! TCP and TLS stream primitive for nodecall.
//!
//! Provides the socket capability the connection layer is built on:
//! - Plain TCP or TLS 1.2/1.3 (rustls, ring provider) streams behind one
//!   [`NetStream`] type
//! - Certificate/key/CA loading from PEM files or memory into a [`TlsContext`]
//! - Listening with per-connection handshakes and bounded connects
//!
//! Framing and dispatch live in higher layers; everything here moves bytes.

pub mod error;
pub mod io;
pub mod stream;
pub mod tls;

pub use error::{Result, TransportError};
pub use io::{connect, Incoming, Listener};
pub use stream::NetStream;
pub use tls::{TlsConfig, TlsContext};
