use std::io::IsTerminal;
use std::net::SocketAddr;
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use nodecall_rpc::{PeerInfo, RpcStats};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PeerEvent<'a> {
    event: &'a str,
    node: u32,
    connection: String,
    socket: String,
    peer: String,
    direction: &'a str,
}

#[derive(Serialize)]
struct ListeningEvent<'a> {
    event: &'a str,
    addr: String,
}

#[derive(Serialize)]
struct CallOutput<'a> {
    event: &'a str,
    node: u32,
    function: &'a str,
    result: &'a serde_json::Value,
    elapsed_ms: u128,
}

#[derive(Serialize)]
struct StatsOutput<'a> {
    event: &'a str,
    #[serde(flatten)]
    stats: StatsFields,
}

#[derive(Serialize)]
struct StatsFields {
    calls_sent: u64,
    broadcast_sends: u64,
    connects: u64,
    dispatched: u64,
    dispatch_errors: u64,
    replies_sent: u64,
    replies_received: u64,
    send_failures: u64,
}

impl From<&RpcStats> for StatsFields {
    fn from(stats: &RpcStats) -> Self {
        Self {
            calls_sent: stats.calls_sent,
            broadcast_sends: stats.broadcast_sends,
            connects: stats.connects,
            dispatched: stats.dispatched,
            dispatch_errors: stats.dispatch_errors,
            replies_sent: stats.replies_sent,
            replies_received: stats.replies_received,
            send_failures: stats.send_failures,
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn direction(peer: &PeerInfo) -> &'static str {
    if peer.is_client {
        "outbound"
    } else {
        "inbound"
    }
}

pub fn print_listening(addr: SocketAddr, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ListeningEvent {
            event: "listening",
            addr: addr.to_string(),
        }),
        OutputFormat::Table | OutputFormat::Pretty => println!("listening on {addr}"),
    }
}

/// One line per connection change.
pub fn print_peer_event(event: &str, peer: &PeerInfo, format: OutputFormat) {
    let connection = format!("{:08x}", peer.connection);
    match format {
        OutputFormat::Json => print_json(&PeerEvent {
            event,
            node: peer.node,
            connection,
            socket: peer.socket.to_string(),
            peer: peer.peer_addr.to_string(),
            direction: direction(peer),
        }),
        OutputFormat::Table | OutputFormat::Pretty => println!(
            "{event} node={} connection={connection} peer={} ({})",
            peer.node,
            peer.peer_addr,
            direction(peer)
        ),
    }
}

pub fn print_call_result(
    node: u32,
    function: &str,
    result: &serde_json::Value,
    elapsed: Duration,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(&CallOutput {
            event: "reply",
            node,
            function,
            result,
            elapsed_ms: elapsed.as_millis(),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NODE", "FUNCTION", "RESULT", "ELAPSED"])
                .add_row(vec![
                    node.to_string(),
                    function.to_string(),
                    result.to_string(),
                    format!("{} ms", elapsed.as_millis()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "{function} -> {result} (node {node}, {} ms)",
            elapsed.as_millis()
        ),
    }
}

pub fn print_stats(stats: &RpcStats, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&StatsOutput {
            event: "stats",
            stats: StatsFields::from(stats),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["COUNTER", "VALUE"]);
            for (name, value) in stats_rows(stats) {
                table.add_row(vec![name.to_string(), value.to_string()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line: Vec<String> = stats_rows(stats)
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            println!("stats {}", line.join(" "));
        }
    }
}

fn stats_rows(stats: &RpcStats) -> [(&'static str, u64); 8] {
    [
        ("calls_sent", stats.calls_sent),
        ("broadcast_sends", stats.broadcast_sends),
        ("connects", stats.connects),
        ("dispatched", stats.dispatched),
        ("dispatch_errors", stats.dispatch_errors),
        ("replies_sent", stats.replies_sent),
        ("replies_received", stats.replies_received),
        ("send_failures", stats.send_failures),
    ]
}
