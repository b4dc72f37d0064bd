use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nodecall_rpc::{NodeId, RpcConfig, TlsConfig, BROADCAST_NODE};
use serde::{Deserialize, Serialize};

use crate::exit::{io_error, CliError, CliResult, CONFIG_INVALID, USAGE};

/// JSON node file passed with `--config`.
///
/// ```json
/// {
///   "listen": ["0.0.0.0:7100"],
///   "peers": [{ "id": 2, "host": "10.0.0.2", "port": 7100 }],
///   "tls": { "cert": "node.pem", "key": "node.key", "ca": "ca.pem" },
///   "max_frame_size": 1048576,
///   "connect_timeout_ms": 5000
/// }
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeFile {
    /// `host:port` addresses to listen on.
    pub listen: Vec<String>,
    pub peers: Vec<PeerEntry>,
    pub tls: Option<TlsEntry>,
    pub max_frame_size: Option<usize>,
    pub retry_defer: Option<u32>,
    pub max_send_attempts: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsEntry {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsEntry {
    /// Resolve relative paths against the node file's directory.
    fn to_config(&self, base: &Path) -> TlsConfig {
        TlsConfig {
            cert_file: base.join(&self.cert),
            key_file: base.join(&self.key),
            ca_file: self.ca.as_ref().map(|ca| base.join(ca)),
            passphrase: self.passphrase.clone(),
            server_name: self.server_name.clone(),
        }
    }
}

impl NodeFile {
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        let mut file: Self = serde_json::from_str(&text).map_err(|err| {
            CliError::new(
                CONFIG_INVALID,
                format!("invalid node file {}: {err}", path.display()),
            )
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        file.resolve_paths(base);
        file.validate()?;
        Ok(file)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if let Some(tls) = self.tls.as_mut() {
            let resolved = tls.to_config(base);
            tls.cert = resolved.cert_file;
            tls.key = resolved.key_file;
            tls.ca = resolved.ca_file;
        }
    }

    fn validate(&self) -> CliResult<()> {
        for addr in &self.listen {
            split_host_port(addr)?;
        }
        if let Some(peer) = self.peers.iter().find(|peer| peer.id == BROADCAST_NODE) {
            return Err(CliError::new(
                CONFIG_INVALID,
                format!("peer {}:{} uses reserved node id 0", peer.host, peer.port),
            ));
        }
        if self.max_frame_size == Some(0) {
            return Err(CliError::new(CONFIG_INVALID, "max_frame_size must be positive"));
        }
        Ok(())
    }

    /// Fold the file's settings into an RPC configuration.
    pub fn apply(&self, config: &mut RpcConfig) {
        if let Some(tls) = &self.tls {
            config.context.tls = Some(tls.to_config(Path::new("")));
        }
        if let Some(max) = self.max_frame_size {
            config.context.frame.max_frame_size = max;
        }
        if let Some(defer) = self.retry_defer {
            config.retry_defer = defer;
        }
        if let Some(attempts) = self.max_send_attempts {
            config.max_send_attempts = attempts;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.context.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.context.idle_timeout = Some(Duration::from_millis(ms));
        }
    }
}

/// Split `host:port`, accepting `[v6]:port`.
pub fn split_host_port(input: &str) -> CliResult<(String, u16)> {
    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| CliError::new(USAGE, format!("expected host:port, got {input:?}")))?;
    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(CliError::new(USAGE, format!("missing host in {input:?}")));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| CliError::new(USAGE, format!("invalid port in {input:?}")))?;
    Ok((host.to_string(), port))
}

/// Parse `id=host:port`.
pub fn parse_peer(input: &str) -> CliResult<PeerEntry> {
    let (id, addr) = input
        .split_once('=')
        .ok_or_else(|| CliError::new(USAGE, format!("expected id=host:port, got {input:?}")))?;
    let id = id
        .trim()
        .parse::<NodeId>()
        .map_err(|_| CliError::new(USAGE, format!("invalid node id in {input:?}")))?;
    if id == BROADCAST_NODE {
        return Err(CliError::new(USAGE, "node id 0 is reserved"));
    }
    let (host, port) = split_host_port(addr.trim())?;
    Ok(PeerEntry { id, host, port })
}
