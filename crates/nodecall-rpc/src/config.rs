use std::time::Duration;

use nodecall_net::{ContextConfig, LoopConfig};

/// Knobs for an [`RpcContext`](crate::RpcContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// TLS material, frame limit and socket timeouts.
    pub context: ContextConfig,
    pub event_loop: LoopConfig,
    /// Drain passes between send attempts while a node has no socket.
    pub retry_defer: u32,
    /// Attempts before a call is given up and reported as failed.
    pub max_send_attempts: u32,
    /// How long `async_run` waits for the loop to confirm it started before
    /// carrying on anyway.
    pub start_timeout: Duration,
    /// Deadline for blocking queries such as `stats` and `node`.
    pub query_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            event_loop: LoopConfig::default(),
            retry_defer: 5,
            // About ten seconds of retrying at the default tick.
            max_send_attempts: 400,
            start_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
        }
    }
}
