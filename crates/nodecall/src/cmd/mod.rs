use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Subcommand};
use nodecall_rpc::{NodeId, RpcConfig, TlsConfig};

use crate::config::NodeFile;
use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Listen for calls and serve the demo functions.
    Serve(ServeArgs),
    /// Call a demo function on a remote node and print the reply.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (host:port). Repeatable.
    #[arg(long, short = 'l', value_name = "ADDR")]
    pub listen: Vec<String>,
    /// Peer to connect to at startup, as id=host:port. Repeatable.
    #[arg(long, value_name = "PEER")]
    pub peer: Vec<String>,
    /// JSON node file with listeners, peers and TLS settings.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    #[command(flatten)]
    pub tls: TlsArgs,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Target node address (host:port).
    pub target: String,
    /// Function to call: echo, add or log.
    pub function: String,
    /// Function arguments.
    #[arg(allow_negative_numbers = true)]
    pub args: Vec<String>,
    /// Node ID to file the target under.
    #[arg(long, default_value = "1")]
    pub node: NodeId,
    /// Maximum time to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// JSON node file with TLS and retry settings.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    #[command(flatten)]
    pub tls: TlsArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct TlsArgs {
    /// PEM certificate chain. Enables TLS.
    #[arg(long, value_name = "PEM", requires = "key")]
    pub cert: Option<PathBuf>,
    /// PEM private key for --cert.
    #[arg(long, value_name = "PEM", requires = "cert")]
    pub key: Option<PathBuf>,
    /// PEM CA bundle used to verify peers.
    #[arg(long, value_name = "PEM", requires = "cert")]
    pub ca: Option<PathBuf>,
    /// Name expected in the peer's certificate instead of its host.
    #[arg(long, value_name = "NAME", requires = "cert")]
    pub server_name: Option<String>,
}

impl TlsArgs {
    fn to_config(&self) -> Option<TlsConfig> {
        let (cert, key) = (self.cert.as_ref()?, self.key.as_ref()?);
        Some(TlsConfig {
            cert_file: cert.clone(),
            key_file: key.clone(),
            ca_file: self.ca.clone(),
            passphrase: None,
            server_name: self.server_name.clone(),
        })
    }
}

/// Merge defaults, the optional node file and command-line TLS flags.
/// Flags win over the file.
pub fn load_config(path: Option<&Path>, tls: &TlsArgs) -> CliResult<(RpcConfig, NodeFile)> {
    let file = match path {
        Some(path) => NodeFile::load(path)?,
        None => NodeFile::default(),
    };
    let mut config = RpcConfig::default();
    file.apply(&mut config);
    if let Some(tls) = tls.to_config() {
        config.context.tls = Some(tls);
    }
    Ok((config, file))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
