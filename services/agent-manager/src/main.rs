// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent Manager Service
//!
//! Accepts agent sessions on one management-server node. It:
//!
//! - Tracks agent status and host intent
//! - Dispatches command batches and correlates answers
//! - Runs long-lived jobs in per-key queues
//! - Hands agents their ordered management-server list
//! - Moves agents to other nodes when this one owns too many

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use agent_manager::{ManagerConfig, ManagerContext, MemoryStore, metrics, transport};

/// Default bind address for agent sessions.
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8250";

/// How long shutdown waits for running jobs.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version and --help
    let args: Vec<String> = std::env::args().collect();
    #[allow(clippy::never_loop)] // Intentional: early return on first recognized arg
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_version();
                println!("Usage: {} [OPTIONS]", args[0]);
                println!();
                println!("Options:");
                println!("  -h, --help       Display this information");
                println!("  -V, --version    Display the program's version number");
                println!();
                println!("Environment variables:");
                println!(
                    "  BIND_ADDRESS          Agent listener address (default: {})",
                    DEFAULT_BIND_ADDRESS
                );
                println!("  MANAGEMENT_SERVER_ID  Numeric id of this node (required)");
                println!("  ADVERTISE_ADDRESS     Address agents use to reach this node (required)");
                println!("  MANAGEMENT_SERVERS    Comma-separated management-server addresses");
                println!("  INDIRECT_AGENT_LB_ALGORITHM  static, roundrobin or shuffle");
                println!(
                    "  CONFIG_FILE           Path to JSON config file for SIGUSR1 reloading (optional)"
                );
                println!("  RUST_LOG              Log filter (default: agent_manager=info)");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "agent_manager=info".to_string()),
        ))
        .init();

    print_version();

    // Load configuration
    let config = ManagerConfig::from_env().context("Failed to load configuration")?;
    info!(
        node_id = config.node_id,
        node_address = %config.node_address,
        management_servers = ?config.management_servers,
        lb_algorithm = %config.lb_algorithm,
        "Configuration loaded"
    );
    let (config_tx, config_rx) = watch::channel(config.clone());

    // Start config file watcher if CONFIG_FILE is set (Unix only)
    #[cfg(unix)]
    if let Ok(config_file) = std::env::var("CONFIG_FILE") {
        use std::path::PathBuf;

        let config_path = PathBuf::from(&config_file);
        if tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            tokio::spawn(ManagerConfig::start_config_watcher(
                config_path,
                config.clone(),
                config_tx,
            ));
            info!(
                config_file = %config_file,
                "Config watcher started - send SIGUSR1 to reload"
            );
        } else {
            tracing::warn!(
                config_file = %config_file,
                "CONFIG_FILE specified but file does not exist, config reloading disabled"
            );
        }
    }

    metrics::register_metrics();

    let ctx = Arc::new(ManagerContext::new(config_rx, Arc::new(MemoryStore::new())));
    ctx.register_self()
        .await
        .context("Failed to register this node")?;

    let resumed = ctx
        .jobs
        .resume_unfinished()
        .await
        .context("Failed to resume unfinished jobs")?;
    if resumed > 0 {
        info!(resumed, "Resumed unfinished jobs");
    }

    ctx.start_background_tasks().await;

    let bind_address = std::env::var("BIND_ADDRESS")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    info!("Agent manager listening on {}", bind_address);

    let server = tokio::spawn(transport::serve(listener, Arc::clone(&ctx)));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    ctx.shutdown(DRAIN_TIMEOUT).await;
    server
        .await
        .map_err(|error| anyhow::anyhow!("listener task failed: {}", error))
}
