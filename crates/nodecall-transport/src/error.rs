use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in TCP/TLS transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// The TLS handshake with a peer failed.
    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        source: std::io::Error,
    },

    /// A connect or handshake did not finish in time.
    #[error("{addr} timed out after {after:?}")]
    Timeout { addr: String, after: Duration },

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// rustls rejected the configuration.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// A certificate, key or CA file could not be loaded.
    #[error("failed to load {path}: {message}")]
    Certificate { path: PathBuf, message: String },

    /// A passphrase was supplied; encrypted private keys are not supported.
    #[error("encrypted private key {path} is not supported (remove the passphrase)")]
    EncryptedKey { path: PathBuf },

    /// The client certificate verifier could not be built.
    #[error("client certificate verifier: {0}")]
    Verifier(String),

    /// The host is neither a DNS name nor an IP address usable for TLS.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
