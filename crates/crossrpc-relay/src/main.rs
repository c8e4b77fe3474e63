//! crossrpc relay - a standalone crossrpc server over TCP.
//!
//! `serve` runs a server context that clients connect to; `call` and
//! `trigger` connect once as a client and invoke a server procedure or event.

mod client;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "crossrpc-relay")]
#[command(about = "Standalone crossrpc server over TCP")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Call a server procedure and print its result as JSON
    Call {
        /// Relay address
        #[arg(long)]
        addr: SocketAddr,

        /// Procedure name
        name: String,

        /// Arguments as JSON
        args: Option<String>,
    },

    /// Trigger a server event
    Trigger {
        /// Relay address
        #[arg(long)]
        addr: SocketAddr,

        /// Event name
        name: String,

        /// Arguments as JSON
        args: Option<String>,
    },
}

fn parse_args(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("args is not valid JSON: {raw}")),
        None => Ok(Value::Null),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG wins over --debug when set.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve { port, host } => {
            info!("Starting crossrpc relay");
            let relay = server::start_relay(&host, port).await?;

            // Print port for the parent process to read (intentional stdout)
            println!("RPC_PORT={}", relay.handle.port);

            info!("Relay running on {}", relay.handle.addr());

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
        }
        Command::Call { addr, name, args } => {
            let args = parse_args(args.as_deref())?;
            let result = client::call(addr, &name, args).await?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Command::Trigger { addr, name, args } => {
            let args = parse_args(args.as_deref())?;
            client::trigger(addr, &name, args).await?;
        }
    }

    Ok(())
}
