//! Unicast Node - serve or call an exactly-once JSON-RPC service.
//!
//! `serve` listens on every `--listen` address and prints one
//! `RPC_ADDR=<addr>` line per bound listener on stdout. `call` sends a single
//! call to every `--peer` and prints the result as JSON.

mod service;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use service::DemoService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use unicast_core::{ClientConfig, InterfaceAddr, Params, ServerConfig, UniCastClient, UniCastServer};

/// How long `serve` waits for the initial listeners before reporting.
const BIND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "unicast-node")]
#[command(about = "Exactly-once JSON-RPC over several network interfaces")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo service
    Serve {
        /// Address to listen on (HOST:PORT, port 0 = auto-assign); repeatable
        #[arg(long = "listen", value_name = "HOST:PORT")]
        listen: Vec<String>,

        /// JSON server configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// HTTP path accepting requests
        #[arg(long)]
        path: Option<String>,
    },

    /// Call a method on a set of peers
    Call {
        /// Peer endpoint (HOST:PORT); repeatable
        #[arg(long = "peer", value_name = "HOST:PORT")]
        peers: Vec<String>,

        /// JSON client configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// HTTP path the peers accept requests on
        #[arg(long)]
        path: Option<String>,

        /// Positional argument as JSON (bare words are sent as strings); repeatable
        #[arg(long = "arg", value_name = "JSON", conflicts_with = "kwargs")]
        args: Vec<String>,

        /// Named arguments as a JSON object
        #[arg(long, value_name = "JSON")]
        kwargs: Option<String>,

        /// Method to call
        method: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; stdout is reserved for RPC_ADDR lines and call results
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
        Command::Serve {
            listen,
            config,
            path,
        } => serve(listen, config, path).await,
        Command::Call {
            peers,
            config,
            path,
            args,
            kwargs,
            method,
        } => call(peers, config, path, args, kwargs, method).await,
    }
}

async fn serve(listen: Vec<String>, config: Option<PathBuf>, path: Option<String>) -> Result<()> {
    let mut config = match config {
        Some(file) => ServerConfig::from_json_file(file)?,
        None => ServerConfig::new(),
    };
    for addr in &listen {
        config = config.with_interface(InterfaceAddr::parse(addr)?);
    }
    if let Some(path) = path {
        config = config.with_path(path);
    }
    if config.interfaces.is_empty() {
        bail!("nothing to listen on: pass --listen or a config with interfaces");
    }

    info!("Starting unicast node");
    let server = UniCastServer::for_service(config, Arc::new(DemoService::default()));
    let expected = server.interfaces().len().await;
    server.start().await?;

    let addrs = match server.wait_for_listeners(expected, BIND_TIMEOUT).await {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("{}; still retrying in the background", e);
            server.local_addrs().await
        }
    };

    // Print bound addresses for callers to read (intentional stdout)
    for addr in &addrs {
        println!("RPC_ADDR={}", addr);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");
    server.stop().await?;

    Ok(())
}

async fn call(
    peers: Vec<String>,
    config: Option<PathBuf>,
    path: Option<String>,
    args: Vec<String>,
    kwargs: Option<String>,
    method: String,
) -> Result<()> {
    let mut config = match config {
        Some(file) => ClientConfig::from_json_file(file)?,
        None => ClientConfig::new(),
    };
    for peer in &peers {
        config = config.with_endpoint(InterfaceAddr::parse(peer)?);
    }
    if let Some(path) = path {
        config = config.with_path(path);
    }

    let params = match kwargs {
        Some(kwargs) => Params::try_from(serde_json::from_str::<Value>(&kwargs)?)?,
        None if args.is_empty() => Params::none(),
        None => Params::Positional(args.iter().map(|arg| parse_arg(arg)).collect()),
    };

    let client = UniCastClient::new(config)?;
    let result = client.invoke(&method, params).await;
    client.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

/// Parse a positional argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
