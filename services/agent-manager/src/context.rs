// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared state for the agent manager
//!
//! [`ManagerContext`] owns one instance of every component and the
//! background tasks that drive them. The transport and the binary only talk
//! to the components through it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use agent_control_types::{ManagementServerNode, NodeId, NodeState, StatusEvent};

use crate::config::ManagerConfig;
use crate::dispatcher::CommandDispatcher;
use crate::jobs::JobQueueManager;
use crate::lb::{IndirectAgentLb, LbAlgorithms};
use crate::listeners::ListenerRegistry;
use crate::rebalance::{ClusterAgentRebalancer, SessionHandoff};
use crate::registry::ConnectionRegistry;
use crate::store::{HostStore, JobStore, NodeStore, StoreError};

/// How often expired command batches are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct ManagerContext {
    config: watch::Receiver<ManagerConfig>,
    node_id: NodeId,
    node_address: String,
    nodes: Arc<dyn NodeStore>,
    pub listeners: Arc<ListenerRegistry>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub jobs: Arc<JobQueueManager>,
    pub lb: Arc<IndirectAgentLb>,
    pub rebalancer: Arc<ClusterAgentRebalancer>,
    /// Bumped whenever a node's membership record changes
    membership: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerContext {
    /// Wire every component on top of `store`
    pub fn new<S>(config: watch::Receiver<ManagerConfig>, store: Arc<S>) -> Self
    where
        S: HostStore + JobStore + NodeStore + 'static,
    {
        let (node_id, node_address, job_workers) = {
            let current = config.borrow();
            (
                current.node_id,
                current.node_address.clone(),
                current.job_workers,
            )
        };
        let hosts: Arc<dyn HostStore> = store.clone();
        let job_store: Arc<dyn JobStore> = store.clone();
        let nodes: Arc<dyn NodeStore> = store;

        let listeners = Arc::new(ListenerRegistry::new());
        let registry = Arc::new(ConnectionRegistry::new(
            node_id,
            Arc::clone(&hosts),
            Arc::clone(&listeners),
            config.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&listeners),
            config.clone(),
        ));
        let jobs = Arc::new(JobQueueManager::new(job_store, job_workers));
        let lb = Arc::new(IndirectAgentLb::new(
            LbAlgorithms::default(),
            Arc::clone(&hosts),
            config.clone(),
        ));
        let handoff = Arc::new(SessionHandoff::new(
            Arc::clone(&registry),
            Arc::clone(&lb),
            node_address.clone(),
        ));
        let rebalancer = Arc::new(ClusterAgentRebalancer::new(
            node_id,
            hosts,
            Arc::clone(&nodes),
            handoff,
            config.clone(),
        ));
        let (membership, _) = watch::channel(0);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            node_id,
            node_address,
            nodes,
            listeners,
            registry,
            dispatcher,
            jobs,
            lb,
            rebalancer,
            membership,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> ManagerConfig {
        self.config.borrow().clone()
    }

    /// Record this node as up in the node table
    pub async fn register_self(&self) -> Result<(), StoreError> {
        self.set_node_state(NodeState::Up).await
    }

    async fn set_node_state(&self, state: NodeState) -> Result<(), StoreError> {
        self.record_node(ManagementServerNode {
            id: self.node_id,
            address: self.node_address.clone(),
            state,
        })
        .await
    }

    /// Record a management-server node joining, leaving or changing address.
    /// Rebalancing and management-server lists follow the change.
    pub async fn record_node(&self, node: ManagementServerNode) -> Result<(), StoreError> {
        let (id, state) = (node.id, node.state);
        self.nodes.upsert_node(node).await?;
        self.membership.send_modify(|epoch| *epoch += 1);
        tracing::info!(node_id = id, state = %state, "Node state recorded");
        Ok(())
    }

    /// Ticks on every node membership change
    pub fn membership_signal(&self) -> watch::Receiver<u64> {
        self.membership.subscribe()
    }

    /// Flips to true once shutdown begins
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start the timeout sweeper, the ping monitor, the list refresher and
    /// the rebalancer
    pub async fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(
            Arc::clone(&self.dispatcher).start_timeout_sweeper(SWEEP_INTERVAL, self.shutdown_signal()),
        );
        tasks.push(self.start_ping_monitor());
        tasks.push(self.start_list_refresher());
        tasks.push(
            Arc::clone(&self.rebalancer).start(self.membership_signal(), self.shutdown_signal()),
        );
    }

    /// Resend management-server lists after a config reload or a node
    /// membership change
    fn start_list_refresher(&self) -> JoinHandle<()> {
        let lb = Arc::clone(&self.lb);
        let registry = Arc::clone(&self.registry);
        let mut config = self.config.clone();
        let mut membership = self.membership_signal();
        let mut shutdown = self.shutdown_signal();

        tokio::spawn(async move {
            let (mut config_open, mut membership_open) = (true, true);
            config.borrow_and_update();
            loop {
                tokio::select! {
                    changed = config.changed(), if config_open => {
                        if changed.is_err() {
                            config_open = false;
                            continue;
                        }
                        config.borrow_and_update();
                    }
                    changed = membership.changed(), if membership_open => {
                        if changed.is_err() {
                            membership_open = false;
                            continue;
                        }
                        membership.borrow_and_update();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                if let Err(e) = lb.refresh_all(&registry).await {
                    tracing::warn!(error = %e, "Failed to refresh management server lists");
                }
            }
            tracing::debug!("List refresher stopped");
        })
    }

    /// Periodically move silent agents to Alert
    fn start_ping_monitor(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        let mut shutdown = self.shutdown_signal();

        tokio::spawn(async move {
            loop {
                let (interval, timeout) = {
                    let config = config.borrow();
                    (
                        Duration::from_secs(config.ping_interval_secs.max(1)),
                        config.ping_timeout(),
                    )
                };

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                let stale = registry.investigate_stale(Instant::now(), timeout).await;
                if !stale.is_empty() {
                    tracing::warn!(agents = ?stale, "Agents missed their ping deadline");
                }
            }
            tracing::debug!("Ping monitor stopped");
        })
    }

    /// Stop background work, drain the job queue, close every session and
    /// mark this node down
    pub async fn shutdown(&self, drain_timeout: Duration) {
        tracing::info!(node_id = self.node_id, "Agent manager shutting down");
        self.shutdown_tx.send_replace(true);

        let persisted = self.jobs.drain(drain_timeout).await;
        if persisted > 0 {
            tracing::info!(persisted, "Unfinished jobs left for the next start");
        }

        for agent_id in self.registry.connected_agents().await {
            self.registry
                .disconnect(agent_id, StatusEvent::AgentDisconnected)
                .await;
        }

        if let Err(e) = self.set_node_state(NodeState::Down).await {
            tracing::warn!(error = %e, "Failed to mark node down");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Agent manager stopped");
    }
}
