// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Cluster agent rebalancing
//!
//! A node owning more routing agents than the cluster average gives whole
//! sub-clusters of its live agents away, largest first, until it is back at
//! the average. The planner is a pure function; [`ClusterAgentRebalancer`]
//! feeds it from the stores and hands the selected agents off.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use agent_control_types::{AgentId, HostRecord, HostType, NodeId, Status};

use crate::config::ManagerConfig;
use crate::lb::{IndirectAgentLb, LbError};
use crate::metrics;
use crate::registry::{ConnectError, ConnectionRegistry};
use crate::store::{HostStore, NodeStore, StoreError};

#[derive(Debug, Error)]
pub enum RebalanceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LB error: {0}")]
    Lb(#[from] LbError),

    #[error("Handoff failed: {0}")]
    Handoff(#[from] ConnectError),
}

/// What to do with a sub-cluster larger than what is still needed, when
/// skipping it would leave too little to reach the target
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum OvershootPolicy {
    /// Stop selecting
    #[default]
    Stop,
    /// Take only the hosts still needed from it, then stop
    Split,
    /// Take all of it, then stop
    TakeWhole,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalancePlan {
    /// Hosts this node should give away
    pub target: usize,
    pub selected: Vec<AgentId>,
}

/// Cluster-wide average of managed hosts per node
pub fn compute_average(total_hosts: usize, nodes: usize) -> Option<f64> {
    (nodes > 0).then(|| total_hosts as f64 / nodes as f64)
}

/// Choose which live hosts to relinquish
///
/// Sub-clusters are visited largest first (ties in input order). One that
/// fits in what is still needed is taken whole. One that does not is
/// skipped while the sub-clusters after it could still cover the need;
/// otherwise `policy` decides.
pub fn plan(
    owned_count: usize,
    average: f64,
    live_hosts: &[HostRecord],
    policy: OvershootPolicy,
) -> RebalancePlan {
    if owned_count as f64 <= average || live_hosts.is_empty() {
        return RebalancePlan::default();
    }
    let target = (owned_count as f64 - average).floor() as usize;

    let mut groups: Vec<(Option<u64>, Vec<AgentId>)> = Vec::new();
    for host in live_hosts {
        match groups.iter_mut().find(|(id, _)| *id == host.sub_cluster_id) {
            Some((_, members)) => members.push(host.id),
            None => groups.push((host.sub_cluster_id, vec![host.id])),
        }
    }
    // Stable: equal sizes keep input order
    groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut selected = Vec::new();
    for (i, (_, members)) in groups.iter().enumerate() {
        let still = target.saturating_sub(selected.len());
        if still == 0 {
            break;
        }
        if members.len() <= still {
            selected.extend_from_slice(members);
            continue;
        }

        let rest: usize = groups[i + 1..].iter().map(|(_, m)| m.len()).sum();
        if rest >= still {
            continue;
        }
        match policy {
            OvershootPolicy::Stop => {}
            OvershootPolicy::Split => selected.extend_from_slice(&members[..still]),
            OvershootPolicy::TakeWhole => selected.extend_from_slice(members),
        }
        break;
    }

    RebalancePlan { target, selected }
}

/// Moves one host to another node
#[async_trait]
pub trait RebalanceHandoff: Send + Sync {
    async fn hand_off(&self, host: &HostRecord) -> Result<(), RebalanceError>;
}

/// Handoff through the connection registry: the agent gets a list that
/// prefers other nodes, then its session is closed
pub struct SessionHandoff {
    registry: Arc<ConnectionRegistry>,
    lb: Arc<IndirectAgentLb>,
    node_address: String,
}

impl SessionHandoff {
    pub fn new(registry: Arc<ConnectionRegistry>, lb: Arc<IndirectAgentLb>, node_address: String) -> Self {
        Self {
            registry,
            lb,
            node_address,
        }
    }
}

#[async_trait]
impl RebalanceHandoff for SessionHandoff {
    async fn hand_off(&self, host: &HostRecord) -> Result<(), RebalanceError> {
        let servers = self.lb.list_avoiding(host.id, &self.node_address).await?;
        self.registry.begin_rebalance(host.id, servers).await?;
        Ok(())
    }
}

pub struct ClusterAgentRebalancer {
    node_id: NodeId,
    hosts: Arc<dyn HostStore>,
    nodes: Arc<dyn NodeStore>,
    handoff: Arc<dyn RebalanceHandoff>,
    config: watch::Receiver<ManagerConfig>,
}

impl ClusterAgentRebalancer {
    pub fn new(
        node_id: NodeId,
        hosts: Arc<dyn HostStore>,
        nodes: Arc<dyn NodeStore>,
        handoff: Arc<dyn RebalanceHandoff>,
        config: watch::Receiver<ManagerConfig>,
    ) -> Self {
        Self {
            node_id,
            hosts,
            nodes,
            handoff,
            config,
        }
    }

    /// One load check. Returns the plan; hosts whose handoff failed stay.
    pub async fn rebalance_once(&self) -> Result<RebalancePlan, RebalanceError> {
        let owned = self
            .hosts
            .list_hosts_owned_by(self.node_id, HostType::Routing)
            .await?;
        let total = self.hosts.count_managed_hosts(HostType::Routing).await?;
        let up_nodes = self.nodes.count_up_nodes().await?;
        let Some(average) = compute_average(total, up_nodes) else {
            return Ok(RebalancePlan::default());
        };

        let live: Vec<HostRecord> = owned
            .iter()
            .filter(|h| h.status == Some(Status::Up))
            .cloned()
            .collect();
        let policy = self.config.borrow().rebalance_policy;
        let plan = plan(owned.len(), average, &live, policy);

        if plan.selected.is_empty() {
            tracing::debug!(
                owned = owned.len(),
                average,
                live = live.len(),
                "No agents to rebalance"
            );
            return Ok(plan);
        }

        tracing::info!(
            owned = owned.len(),
            average,
            target = plan.target,
            selected = plan.selected.len(),
            policy = %policy,
            "Rebalancing agents away from this node"
        );

        let mut moved = 0;
        for id in &plan.selected {
            let Some(host) = live.iter().find(|h| h.id == *id) else {
                continue;
            };
            match self.handoff.hand_off(host).await {
                Ok(()) => moved += 1,
                Err(e) => tracing::warn!(agent_id = *id, error = %e, "Agent handoff failed"),
            }
        }
        metrics::record_agents_relinquished(moved);
        Ok(plan)
    }

    /// Run load checks every `rebalance_interval_secs`, and whenever the
    /// node membership epoch moves, until `shutdown`
    pub fn start(
        self: Arc<Self>,
        mut membership: watch::Receiver<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(node_id = self.node_id, "Rebalancer started");
            let mut membership_open = true;
            loop {
                let (enabled, interval) = {
                    let config = self.config.borrow();
                    (
                        config.rebalance_enabled,
                        Duration::from_secs(config.rebalance_interval_secs.max(1)),
                    )
                };

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = membership.changed(), if membership_open => {
                        if changed.is_err() {
                            membership_open = false;
                            continue;
                        }
                        let epoch = *membership.borrow_and_update();
                        tracing::debug!(epoch, "Node membership changed");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                if !enabled {
                    continue;
                }
                if let Err(e) = self.rebalance_once().await {
                    tracing::warn!(error = %e, "Rebalance cycle failed, retrying next cycle");
                }
            }
            tracing::info!("Rebalancer stopped");
        })
    }
}
