use nodecall_codec::{from_slice, Buffer};
use nodecall_rpc::{FunctionRegistry, RegistryError};
use serde_json::Value;
use tracing::info;

use crate::exit::{CliError, CliResult, DATA_INVALID, USAGE};

/// Return the message unchanged.
pub fn echo(message: String) -> String {
    message
}

pub fn add(a: i64, b: i64) -> i64 {
    a.wrapping_add(b)
}

/// Write the message to the serving node's log.
pub fn log(message: String) {
    info!(%message, "remote log");
}

/// Both ends derive function IDs from registration order, so `serve` and
/// `call` must register the same functions in the same order.
pub fn register_demo(registry: &FunctionRegistry) -> Result<(), RegistryError> {
    registry.register("echo", echo)?;
    registry.register("add", add)?;
    registry.register("log", log)?;
    Ok(())
}

/// A demo call parsed from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoCall {
    Echo(String),
    Add(i64, i64),
    Log(String),
}

impl DemoCall {
    pub fn parse(function: &str, args: &[String]) -> CliResult<Self> {
        match (function, args) {
            ("echo", [message]) => Ok(Self::Echo(message.clone())),
            ("log", [message]) => Ok(Self::Log(message.clone())),
            ("add", [a, b]) => Ok(Self::Add(parse_int(a)?, parse_int(b)?)),
            ("echo" | "log", _) => Err(CliError::new(
                USAGE,
                format!("{function} takes one argument, got {}", args.len()),
            )),
            ("add", _) => Err(CliError::new(
                USAGE,
                format!("add takes two arguments, got {}", args.len()),
            )),
            _ => Err(CliError::new(
                USAGE,
                format!("unknown function {function:?} (expected echo, add or log)"),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Echo(_) => "echo",
            Self::Add(..) => "add",
            Self::Log(_) => "log",
        }
    }

    /// Decode a reply payload into JSON for printing.
    pub fn decode_reply(&self, payload: &Buffer) -> CliResult<Value> {
        let bytes = payload.as_slice();
        let value = match self {
            Self::Echo(_) => from_slice::<String>(bytes).map(Value::from),
            Self::Add(..) => from_slice::<i64>(bytes).map(Value::from),
            Self::Log(_) => from_slice::<()>(bytes).map(|()| Value::Null),
        };
        value.map_err(|err| {
            CliError::new(
                DATA_INVALID,
                format!("undecodable {} reply: {err}", self.name()),
            )
        })
    }
}

fn parse_int(input: &str) -> CliResult<i64> {
    input
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid integer: {input}")))
}
