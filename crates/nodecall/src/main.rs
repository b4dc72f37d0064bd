mod cmd;
mod config;
mod demo;
mod exit;
mod logging;
mod output;

use clap::{Args, Parser};

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "nodecall", version, about = "Remote function calls by node ID")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

/// Options accepted before or after any subcommand.
#[derive(Args, Debug)]
struct GlobalArgs {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,
}

fn main() {
    let Cli { global, command } = Cli::parse();
    init_logging(global.log_format, global.log_level);

    let format = global
        .format
        .unwrap_or_else(OutputFormat::default_for_stdout);
    let code = cmd::run(command, format).unwrap_or_else(|err| {
        eprintln!("error: {err}");
        err.code
    });
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_with_negative_argument() {
        let cli = Cli::try_parse_from([
            "nodecall",
            "call",
            "127.0.0.1:7100",
            "add",
            "2",
            "-3",
            "--format",
            "json",
        ])
        .expect("call args should parse");

        match cli.command {
            Command::Call(args) => {
                assert_eq!(args.function, "add");
                assert_eq!(args.args, vec!["2".to_string(), "-3".to_string()]);
                assert_eq!(args.node, 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.global.format, Some(OutputFormat::Json));
    }

    #[test]
    fn parses_repeated_serve_flags() {
        let cli = Cli::try_parse_from([
            "nodecall",
            "serve",
            "--listen",
            "127.0.0.1:7100",
            "--listen",
            "127.0.0.1:7101",
            "--peer",
            "2=10.0.0.2:7100",
        ])
        .expect("serve args should parse");

        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.listen.len(), 2);
                assert_eq!(args.peer, vec!["2=10.0.0.2:7100".to_string()]);
                assert!(args.config.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_key_without_cert() {
        let err = Cli::try_parse_from([
            "nodecall",
            "serve",
            "--listen",
            "127.0.0.1:7100",
            "--key",
            "node.key",
        ])
        .expect_err("--key alone should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
