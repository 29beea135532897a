//! Command-line entry point for the multiplexer.
//!
//! Invocation is `chorus [options] -- <server argv>... [-- <server argv>...]...`;
//! the argument vector is split on `--` before clap sees the option prefix,
//! so server commands can carry arbitrary flags of their own.

use anyhow::{bail, Result};
use chorus::{
    backend::{self, BackendProcess},
    create_policy, BackendLink, Router, RouterOptions, StreamWire,
};
use chorus_log::LogLevel;
use clap::Parser;
use std::{sync::Arc, time::Duration};

#[derive(Debug, Parser)]
#[command(
    name = "chorus",
    about = "Run several LSP servers as one.",
    override_usage = "chorus [OPTIONS] -- <server> [args]... [-- <server2> [args]...]..."
)]
struct Cli {
    /// Suppress forwarding of the servers' stderr.
    #[arg(long)]
    quiet_server: bool,

    /// Delay every message to the client by N milliseconds.
    #[arg(long, value_name = "N", default_value_t = 0)]
    delay_ms: u64,

    /// Drop tardy messages instead of re-sending aggregations.
    #[arg(long)]
    drop_tardy: bool,

    /// Routing logic to use.
    #[arg(long, value_name = "NAME", default_value = "lsp")]
    logic_class: String,

    /// Logging verbosity: silent|warn|info|event|debug|trace.
    #[arg(long, value_name = "LEVEL", default_value = "event")]
    log_level: LogLevel,

    /// Maximum log line length in bytes; 0 for unlimited.
    #[arg(long, value_name = "N", default_value_t = 4000)]
    max_log_length: usize,
}

/// Split argv into the option prefix and the `--`-separated server commands.
fn split_server_commands(args: &[String]) -> (Vec<String>, Vec<Vec<String>>) {
    let mut chunks = args.split(|arg| arg.as_str() == "--");
    let options = chunks.next().unwrap_or(&[]).to_vec();
    let commands = chunks
        .filter(|command| !command.is_empty())
        .map(<[String]>::to_vec)
        .collect();
    (options, commands)
}

pub fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (options, commands) = split_server_commands(&args);

    let cli = match Cli::try_parse_from(std::iter::once("chorus".to_owned()).chain(options)) {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return error.exit_code();
        }
    };

    chorus_log::init(cli.log_level, cli.max_log_length);

    if commands.is_empty() {
        tracing::info!(
            "Usage: chorus [OPTIONS] -- <primary-server> [args] [-- <secondary-server> [args]]..."
        );
        return 1;
    }

    match smol::block_on(run_multiplexer(cli, commands)) {
        Ok(()) => 0,
        Err(error) => {
            tracing::warn!("Fatal error: {error:#}");
            1
        }
    }
}

async fn run_multiplexer(cli: Cli, commands: Vec<Vec<String>>) -> Result<()> {
    let Some(policy) = create_policy(&cli.logic_class) else {
        bail!("unknown logic class `{}`", cli.logic_class);
    };
    tracing::info!("Logic class: {}", cli.logic_class);

    let mut children = Vec::new();
    let mut links = Vec::new();
    let mut forwarders = Vec::new();
    // Unread stderr pipes are kept open so quieted servers don't take a
    // SIGPIPE; like any ignored pipe they may stall a very chatty writer.
    let mut muted_stderr = Vec::new();

    for (index, command) in commands.iter().enumerate() {
        let BackendProcess {
            id,
            name,
            wire,
            stderr,
            child,
        } = backend::spawn(command, index)?;

        if let Some(stderr) = stderr {
            if cli.quiet_server {
                muted_stderr.push(stderr);
            } else {
                forwarders.push(smol::spawn(backend::forward_stderr(name.clone(), stderr)));
            }
        }

        links.push(BackendLink { id, name, wire });
        children.push(child);
    }

    let client = Arc::new(StreamWire::stdio());
    let options = RouterOptions {
        delay: (cli.delay_ms > 0).then(|| Duration::from_millis(cli.delay_ms)),
        drop_tardy: cli.drop_tardy,
    };

    Router::new(client, links, policy, options).run().await?;

    for child in &mut children {
        let _ = child.status().await;
    }
    Ok(())
}
