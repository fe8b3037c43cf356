//! nimbus: weather tools behind a session-multiplexed streaming JSON-RPC gateway
//!
//! Usage:
//!   nimbus serve [--host H] [--port P]
//!   nimbus tools
//!   nimbus config

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nimbus_core::{NwsClient, default_registry};
use nimbus_gateway::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "nimbus", version, about = "Weather tools over a streaming JSON-RPC gateway")]
struct Cli {
    /// Config file (defaults to ~/.config/nimbus/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway (default)
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the tool catalogue as JSON
    Tools,
    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let mut config = Config::load(path)?;
    config.apply_port_override(std::env::var("PORT").ok().as_deref())?;
    Ok(config)
}

fn build_router(config: &Config) -> Result<Router> {
    let source = Arc::new(NwsClient::new(&config.weather)?);
    let tools = Arc::new(default_registry(source));
    Ok(Router::with_tools(config.gateway.clone(), tools))
}

async fn run_serve(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let router = Arc::new(build_router(&config)?);
    info!(
        "nimbus v{} serving {} tool(s)",
        env!("CARGO_PKG_VERSION"),
        router.dispatcher().list().len()
    );

    let shutdown = CancellationToken::new();
    let reaper = router.registry().spawn_reaper(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        signal.cancel();
    });

    let served = server::serve(router.clone(), addr, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = reaper.await {
        warn!("Session reaper task failed: {}", e);
    }
    router.registry().shutdown_all().await;
    info!("nimbus stopped");
    served
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => run_serve(config, host, port).await,
        Command::Tools => {
            let router = build_router(&config)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&router.dispatcher().catalogue())?
            );
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
