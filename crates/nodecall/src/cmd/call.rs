use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use nodecall_codec::Buffer;
use nodecall_rpc::{FunctionRegistry, NodeId, RpcConfig, RpcContext, SendFailure};
use tracing::debug;

use crate::cmd::{load_config, parse_duration, CallArgs};
use crate::config::split_host_port;
use crate::demo::{self, register_demo, DemoCall};
use crate::exit::{rpc_error, send_failure, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT};
use crate::output::{print_call_result, OutputFormat};

enum Outcome {
    Reply(NodeId, Buffer),
    Failed(NodeId, SendFailure),
}

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let call = DemoCall::parse(&args.function, &args.args)?;
    let (host, port) = split_host_port(&args.target)?;
    let (mut config, _) = load_config(args.config.as_deref(), &args.tls)?;
    bound_retries(&mut config, timeout);

    let registry = FunctionRegistry::global();
    register_demo(&registry).map_err(|err| rpc_error("register failed", err.into()))?;
    let ctx = RpcContext::with_registry(config, registry)
        .map_err(|err| rpc_error("setup failed", err))?;

    let (tx, rx) = mpsc::channel();
    let failed_tx = tx.clone();
    ctx.on_reply(move |node, payload| {
        let _ = tx.send(Outcome::Reply(node, payload));
    })
    .and_then(|()| {
        ctx.on_send_failed(move |node, failure| {
            let _ = failed_tx.send(Outcome::Failed(node, failure.clone()));
        })
    })
    .and_then(|()| ctx.add_node(args.node, host, port))
    .and_then(|()| ctx.async_run())
    .map_err(|err| rpc_error("setup failed", err))?;

    let started = Instant::now();
    let node = args.node;
    let sent = match &call {
        DemoCall::Echo(message) => ctx.call_with_reply(node, &demo::echo, (message.clone(),)),
        DemoCall::Add(a, b) => ctx.call_with_reply(node, &demo::add, (*a, *b)),
        DemoCall::Log(message) => ctx.call_with_reply(node, &demo::log, (message.clone(),)),
    };
    sent.map_err(|err| rpc_error("call failed", err))?;
    debug!(node, function = call.name(), "call queued");

    match rx.recv_timeout(timeout) {
        Ok(Outcome::Reply(from, payload)) => {
            let value = call.decode_reply(&payload)?;
            print_call_result(from, call.name(), &value, started.elapsed(), format);
            ctx.shutdown()
                .map_err(|err| rpc_error("shutdown failed", err))?;
            Ok(SUCCESS)
        }
        Ok(Outcome::Failed(node, failure)) => Err(send_failure(node, &failure)),
        Err(RecvTimeoutError::Timeout) => Err(CliError::new(
            TIMEOUT,
            format!("no reply from node {node} within {timeout:?}"),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(CliError::new(
            INTERNAL,
            "event loop stopped before the call completed",
        )),
    }
}

/// Give up resending about when the reply timeout expires, so an unreachable
/// target is reported as a send failure rather than a bare timeout.
fn bound_retries(config: &mut RpcConfig, timeout: Duration) {
    let window = config.event_loop.tick * config.retry_defer.max(1);
    let attempts = timeout.as_millis() / window.as_millis().max(1);
    let attempts = u32::try_from(attempts).unwrap_or(u32::MAX).max(1);
    config.max_send_attempts = config.max_send_attempts.min(attempts);
}
