// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Configuration for the agent manager

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::watch;

use agent_control_types::NodeId;

use crate::lb::LbAlgorithmKind;
use crate::rebalance::OvershootPolicy;

/// Default time `send_sync` waits for control commands (seconds)
pub const DEFAULT_WAIT_SECS: u64 = 1800;

/// Manager configuration loaded from environment variables or JSON file
///
/// Configuration can be loaded from:
/// 1. Environment variables (primary method, see `from_env()`)
/// 2. JSON config file (for SIGUSR1-based reloading, see `from_file()`)
///
/// The JSON config file supports a subset of fields that are safe to change at runtime.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Identity of this management-server node
    /// Note: This field is NOT reloadable - changes require restart
    #[serde(skip)]
    pub node_id: NodeId,

    /// Address agents use to reach this node
    /// Note: This field is NOT reloadable - changes require restart
    #[serde(skip)]
    pub node_address: String,

    /// Ordered management-server addresses handed to agents
    pub management_servers: Vec<String>,

    /// How long a synchronous send waits for its answers (seconds)
    pub wait_secs: u64,

    /// Indirect agent LB algorithm
    pub lb_algorithm: LbAlgorithmKind,

    /// Automatically disable hosts failing their health check, and re-enable
    /// them once it passes again
    pub auto_enable_disable: bool,

    /// Per-sub-cluster overrides of `auto_enable_disable`
    pub auto_enable_disable_overrides: HashMap<u64, bool>,

    /// Size of the job worker pool
    /// Note: This field is NOT reloadable - changes require restart
    #[serde(skip)]
    pub job_workers: usize,

    /// Expected interval between agent pings (seconds)
    pub ping_interval_secs: u64,

    /// An agent silent for `ping_interval_secs * ping_timeout_multiplier` is
    /// moved to Alert and disconnected
    pub ping_timeout_multiplier: f64,

    pub rebalance_enabled: bool,

    /// Interval between periodic load checks (seconds)
    pub rebalance_interval_secs: u64,

    /// Tie-break applied when a sub-cluster is larger than what is left to give
    pub rebalance_policy: OvershootPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            node_address: String::new(),
            management_servers: Vec::new(),
            wait_secs: DEFAULT_WAIT_SECS,
            lb_algorithm: LbAlgorithmKind::Static,
            auto_enable_disable: false,
            auto_enable_disable_overrides: HashMap::new(),
            job_workers: 10,
            ping_interval_secs: 60,
            ping_timeout_multiplier: 2.5,
            rebalance_enabled: true,
            rebalance_interval_secs: 60,
            rebalance_policy: OvershootPolicy::Stop,
        }
    }
}

/// Parse an optional environment variable, falling back to `default`
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

/// Parse a boolean environment variable
/// Accepts "true", "1", "yes" (case-insensitive) as true, anything else as false
fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let node_id = std::env::var("MANAGEMENT_SERVER_ID")
            .context("MANAGEMENT_SERVER_ID environment variable required")?
            .parse()
            .context("Invalid MANAGEMENT_SERVER_ID")?;

        let node_address = std::env::var("ADVERTISE_ADDRESS")
            .context("ADVERTISE_ADDRESS environment variable required")?;

        // Parse MANAGEMENT_SERVERS as a comma-separated list
        // Example: "10.1.1.1,10.1.1.2" -> vec!["10.1.1.1", "10.1.1.2"]
        let management_servers = std::env::var("MANAGEMENT_SERVERS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let management_servers = if management_servers.is_empty() {
            vec![node_address.clone()]
        } else {
            management_servers
        };

        Ok(Self {
            node_id,
            node_address,
            management_servers,
            wait_secs: env_or("WAIT_SECS", defaults.wait_secs)?,
            lb_algorithm: env_or("INDIRECT_AGENT_LB_ALGORITHM", defaults.lb_algorithm)?,
            auto_enable_disable: env_flag("AUTO_ENABLE_DISABLE", defaults.auto_enable_disable),
            auto_enable_disable_overrides: HashMap::new(),
            job_workers: env_or("JOB_WORKERS", defaults.job_workers)?,
            ping_interval_secs: env_or("PING_INTERVAL_SECS", defaults.ping_interval_secs)?,
            ping_timeout_multiplier: env_or(
                "PING_TIMEOUT_MULTIPLIER",
                defaults.ping_timeout_multiplier,
            )?,
            rebalance_enabled: env_flag("REBALANCE_ENABLED", defaults.rebalance_enabled),
            rebalance_interval_secs: env_or(
                "REBALANCE_INTERVAL_SECS",
                defaults.rebalance_interval_secs,
            )?,
            rebalance_policy: env_or("REBALANCE_OVERSHOOT_POLICY", defaults.rebalance_policy)?,
        })
    }

    /// Load configuration from a JSON file
    ///
    /// This is used for runtime configuration reloading via SIGUSR1.
    /// Note that some fields (like node_id) cannot be reloaded at runtime
    /// and will retain their original values.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Merge runtime-reloadable fields from another config
    ///
    /// This preserves non-reloadable fields (node identity, worker pool size)
    /// while updating fields that can be safely changed at runtime.
    pub fn merge_reloadable(&mut self, other: &ManagerConfig) {
        if !other.management_servers.is_empty() {
            self.management_servers = other.management_servers.clone();
        }
        self.wait_secs = other.wait_secs;
        self.lb_algorithm = other.lb_algorithm;
        self.auto_enable_disable = other.auto_enable_disable;
        self.auto_enable_disable_overrides = other.auto_enable_disable_overrides.clone();
        self.ping_interval_secs = other.ping_interval_secs;
        self.ping_timeout_multiplier = other.ping_timeout_multiplier;
        self.rebalance_enabled = other.rebalance_enabled;
        self.rebalance_interval_secs = other.rebalance_interval_secs;
        self.rebalance_policy = other.rebalance_policy;
    }

    /// Default wait for synchronous sends
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    /// How long an agent may stay silent before it is investigated
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ping_interval_secs as f64 * self.ping_timeout_multiplier)
    }

    /// Whether health-check driven enable/disable applies to a sub-cluster
    pub fn auto_enable_disable_for(&self, sub_cluster_id: Option<u64>) -> bool {
        sub_cluster_id
            .and_then(|id| self.auto_enable_disable_overrides.get(&id).copied())
            .unwrap_or(self.auto_enable_disable)
    }

    /// Start watching for SIGUSR1 to reload config from file
    ///
    /// When SIGUSR1 is received, the config file is re-read and the new
    /// configuration is sent to subscribers via the watch channel.
    ///
    /// # Arguments
    /// * `config_file` - Path to the JSON config file
    /// * `current_config` - The current configuration (for preserving non-reloadable fields)
    /// * `config_tx` - Channel to send updated configuration
    #[cfg(unix)]
    pub async fn start_config_watcher(
        config_file: std::path::PathBuf,
        current_config: Self,
        config_tx: watch::Sender<Self>,
    ) {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to register SIGUSR1 handler");
                return;
            }
        };

        let mut config = current_config;

        loop {
            sigusr1.recv().await;
            tracing::info!(
                config_file = %config_file.display(),
                "Received SIGUSR1, reloading config"
            );

            match Self::from_file(&config_file).await {
                Ok(new_config) => {
                    config.merge_reloadable(&new_config);

                    if config_tx.send(config.clone()).is_err() {
                        tracing::warn!("No config subscribers, reload had no effect");
                    } else {
                        tracing::info!(
                            management_servers = ?config.management_servers,
                            lb_algorithm = %config.lb_algorithm,
                            wait_secs = config.wait_secs,
                            "Config reloaded successfully"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        config_file = %config_file.display(),
                        "Failed to reload config"
                    );
                }
            }
        }
    }
}
