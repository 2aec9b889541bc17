//! DUT Remote Agent daemon.
//!
//! Binds the JSON-RPC TCP server and the UDP discovery responder, then
//! serves until killed.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use dutr_common::config::AgentConfig;
use dutr_common::{LogConfig, init_logging};
use dutrd::rpc::AgentContext;
use dutrd::{discovery, rpc};

#[derive(Parser)]
#[command(name = "dutrd")]
#[command(author, version, about = "DUT remote agent - remote execution and transfer")]
struct Cli {
    /// Address to bind the RPC and discovery sockets to
    #[arg(short, long)]
    bind: Option<String>,

    /// TCP port for the JSON-RPC server
    #[arg(short, long)]
    port: Option<u16>,

    /// UDP port for discovery pings (0 disables discovery)
    #[arg(short, long)]
    discovery_port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, env_errors) = AgentConfig::from_env();
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if let Some(port) = cli.port {
        config.rpc_port = port;
    }
    if let Some(port) = cli.discovery_port {
        config.discovery_port = port;
    }

    let mut log_config = LogConfig::from_env(&config.log_level);
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _ = init_logging(&log_config);

    for err in &env_errors {
        warn!(%err, "ignoring bad environment override");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting DUT remote agent");

    let listener = TcpListener::bind((config.bind_address.as_str(), config.rpc_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind RPC listener on {}:{}",
                config.bind_address, config.rpc_port
            )
        })?;
    let rpc_port = listener.local_addr()?.port();
    info!(address = %config.bind_address, port = rpc_port, "RPC server listening");

    if config.discovery_port != 0 {
        let bind_address = config.bind_address.clone();
        let discovery_port = config.discovery_port;
        tokio::spawn(async move {
            if let Err(err) = discovery::run(&bind_address, discovery_port, rpc_port).await {
                warn!(%err, "discovery responder stopped");
            }
        });
    }

    let ctx = Arc::new(AgentContext::new(config));
    rpc::serve(listener, ctx).await;
    Ok(())
}
