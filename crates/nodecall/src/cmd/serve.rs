use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nodecall_rpc::{FunctionRegistry, RpcContext};
use tracing::{info, warn};

use crate::cmd::{load_config, ServeArgs};
use crate::config::{parse_peer, split_host_port};
use crate::demo::register_demo;
use crate::exit::{rpc_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_listening, print_peer_event, print_stats, OutputFormat};

const BIND_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let (config, file) = load_config(args.config.as_deref(), &args.tls)?;

    let listen = file
        .listen
        .iter()
        .chain(&args.listen)
        .map(|addr| split_host_port(addr))
        .collect::<CliResult<Vec<_>>>()?;
    if listen.is_empty() {
        return Err(CliError::usage(
            "nothing to listen on: pass --listen or a node file with listen addresses",
        ));
    }
    let mut peers = file.peers.clone();
    for peer in &args.peer {
        peers.push(parse_peer(peer)?);
    }

    let registry = FunctionRegistry::global();
    register_demo(&registry).map_err(|err| rpc_error("register failed", err.into()))?;
    let ctx = RpcContext::with_registry(config, registry)
        .map_err(|err| rpc_error("setup failed", err))?;

    ctx.on_open(move |peer| print_peer_event("open", peer, format))
        .and_then(|()| ctx.on_close(move |peer| print_peer_event("close", peer, format)))
        .and_then(|()| {
            ctx.on_send_failed(|node, failure| warn!(node, %failure, "call dropped"))
        })
        .map_err(|err| rpc_error("setup failed", err))?;

    for peer in &peers {
        ctx.add_node(peer.id, peer.host.clone(), peer.port)
            .map_err(|err| rpc_error("add peer failed", err))?;
        ctx.connect(peer.host.clone(), peer.port)
            .map_err(|err| rpc_error("connect failed", err))?;
    }

    ctx.async_run()
        .map_err(|err| rpc_error("event loop failed to start", err))?;
    for (host, port) in listen {
        let addr = ctx
            .listen_and_wait(host, port, BIND_TIMEOUT)
            .map_err(|err| rpc_error("bind failed", err))?;
        print_listening(addr, format);
    }
    info!(peers = peers.len(), "serving");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
    }

    info!("shutting down");
    ctx.shutdown()
        .map_err(|err| rpc_error("shutdown failed", err))?;
    let stats = ctx.wait().map_err(|err| rpc_error("event loop failed", err))?;
    print_stats(&stats, format);
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
