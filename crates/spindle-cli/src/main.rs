//! spindle: interactive command-line client.
//!
//! Connects, authenticates, then reads `<plugin> <command> [args…]` lines
//! from stdin and streams each command's output back to the terminal.

mod client;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::client::{Client, ClientConfig};

/// Ceiling for a single one-shot command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// spindle - client for the spindle plugin host
#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the JSON client configuration file
    #[arg(short, long, default_value = "client.json")]
    config: PathBuf,

    /// Override the server address from the config file
    #[arg(long)]
    addr: Option<String>,

    /// Override the client id from the config file
    #[arg(long)]
    client_id: Option<String>,

    /// Override the shared secret from the config file
    #[arg(long)]
    secret: Option<String>,
}

fn print_help() {
    println!("commands:");
    println!("  <plugin> <command> [args...]   run a plugin command");
    println!("  heartbeat                      probe server liveness");
    println!("  help                           show this help");
    println!("  exit | quit                    leave");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = ClientConfig::from_file(&args.config)?;
    if let Some(addr) = args.addr {
        config.server_addr = addr;
    }
    if let Some(client_id) = args.client_id {
        config.client_id = client_id;
    }
    if let Some(secret) = args.secret {
        config.secret = secret;
    }

    let mut client = Client::connect(config).await?;
    let session_id = client
        .authenticate()
        .await
        .context("authentication failed")?;
    println!("connected and authenticated (session {session_id})");
    println!("type 'help' for available commands");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "exit" | "quit" => break,
            "help" => {
                print_help();
                continue;
            },
            "heartbeat" => {
                match client.heartbeat().await {
                    Ok(timestamp) => println!("server alive, server time {timestamp}"),
                    Err(e) => eprintln!("heartbeat failed: {e:#}"),
                }
                continue;
            },
            _ => {},
        }

        let mut parts = line.split_whitespace();
        let (Some(plugin), Some(command)) = (parts.next(), parts.next()) else {
            eprintln!("invalid command, use: <plugin> <command> [args...]");
            continue;
        };
        let command_args: Vec<String> = parts.map(ToString::to_string).collect();

        let outcome = tokio::time::timeout(
            COMMAND_TIMEOUT,
            client.execute(plugin, command, &command_args, &mut stdout),
        )
        .await;

        match outcome {
            Ok(Ok(outcome)) if outcome.success => {},
            Ok(Ok(outcome)) => {
                eprintln!(
                    "command failed: {}",
                    outcome.message.unwrap_or_else(|| "unknown error".to_string())
                );
            },
            Ok(Err(e)) => eprintln!("error: {e:#}"),
            Err(_) => {
                // The connection is in an unknown mid-stream state after a
                // timeout; bail out rather than desynchronize.
                eprintln!("command timed out after {COMMAND_TIMEOUT:?}");
                break;
            },
        }
    }

    client.close().await;
    Ok(())
}
