use std::fmt;
use std::io;

use nodecall_net::NetError;
use nodecall_rpc::{RegistryError, RpcError, SendFailure};
use nodecall_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const CONFIG_INVALID: i32 = 78;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

/// An error with the process exit code it maps to.
#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        io::ErrorKind::NotFound => CONFIG_INVALID,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::Certificate { .. } | TransportError::EncryptedKey { .. } => {
            CliError::new(CONFIG_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn net_error(context: &str, err: NetError) -> CliError {
    match err {
        NetError::Transport(err) => transport_error(context, err),
        NetError::Frame(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        NetError::Runtime(source) => io_error(context, source),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    match err {
        RpcError::Net(err) => net_error(context, err),
        RpcError::Registry(RegistryError::Decode(_)) | RpcError::Codec(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        RpcError::Registry(_) | RpcError::ReservedNode(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        RpcError::Timeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn send_failure(node: u32, failure: &SendFailure) -> CliError {
    let code = match failure {
        SendFailure::UnknownNode | SendFailure::NoAddress => USAGE,
        SendFailure::RetriesExhausted { .. } => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("call to node {node} failed: {failure}"))
}
