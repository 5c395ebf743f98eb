// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Connection registry
//!
//! Owns one [`AgentSession`] per connected agent. A session carries the
//! agent's liveness, its sequence counter and the table of requests still
//! waiting for answers. Both live behind the session's own lock, so two
//! sends to the same agent never share a sequence number and tearing a
//! session down is just draining its table.
//!
//! Every lifecycle change is written through to the [`HostStore`] and fanned
//! out to the [`ListenerRegistry`] after all locks are released.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, oneshot, watch};
use tokio::time::Instant;

use agent_control_types::{
    AgentFrame, AgentHello, AgentId, Answer, Command, ControlState, HostRecord, NodeId,
    ResourceState, Sequence, Status, StatusEvent,
};

use crate::config::ManagerConfig;
use crate::dispatcher::DispatchError;
use crate::health;
use crate::listeners::{AgentListener, ListenerRegistry};
use crate::metrics;
use crate::store::{HostStore, StoreError};
use crate::transport::AgentLink;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Agent {0} is not connected")]
    NotConnected(AgentId),

    #[error("Agent {agent_id} cannot apply {event} in status {status}")]
    InvalidTransition {
        agent_id: AgentId,
        status: Status,
        event: StatusEvent,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub(crate) type AnswerSender = oneshot::Sender<Result<Vec<Answer>, DispatchError>>;

/// An outbound command batch still waiting for its answers
pub struct PendingRequest {
    pub seq: Sequence,
    pub command_count: usize,
    pub listener: Option<Arc<dyn AgentListener>>,
    pub submitted_at: Instant,
    /// `None` never expires through the sweeper
    pub deadline: Option<Instant>,
    pub(crate) waiter: Option<AnswerSender>,
}

struct SessionState {
    status: Status,
    next_seq: Sequence,
    pending: HashMap<Sequence, PendingRequest>,
    last_seen: Instant,
    closed: bool,
    /// Management-server list last sent to the agent
    servers: Option<Vec<String>>,
}

/// Result of a successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub agent_id: AgentId,
    pub generation: u64,
    pub status: Status,
}

pub struct AgentSession {
    hello: AgentHello,
    generation: u64,
    connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    link: Arc<dyn AgentLink>,
}

impl AgentSession {
    fn new(hello: AgentHello, generation: u64, status: Status, link: Arc<dyn AgentLink>) -> Self {
        Self {
            hello,
            generation,
            connected_at: Utc::now(),
            state: Mutex::new(SessionState {
                status,
                next_seq: 1,
                pending: HashMap::new(),
                last_seen: Instant::now(),
                closed: false,
                servers: None,
            }),
            link,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.hello.agent_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sub_cluster_id(&self) -> Option<u64> {
        self.hello.sub_cluster_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub async fn status(&self) -> Status {
        self.state.lock().await.status
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn assigned_servers(&self) -> Option<Vec<String>> {
        self.state.lock().await.servers.clone()
    }

    /// Send `servers` unless the agent already holds a list `changed`
    /// judges equivalent. Returns whether a frame went out.
    pub(crate) async fn offer_servers(
        &self,
        servers: Vec<String>,
        changed: impl FnOnce(&[String], &[String]) -> bool,
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        if let Some(previous) = &state.servers {
            if !changed(previous, &servers) {
                return false;
            }
        }
        let frame = AgentFrame::ManagementServerList {
            management_servers: servers.clone(),
        };
        if let Err(e) = self.link.send(frame) {
            tracing::warn!(agent_id = self.agent_id(), error = %e, "Failed to send management server list");
            return false;
        }
        state.servers = Some(servers);
        true
    }

    /// Allocate the next sequence, record the pending request and write the
    /// batch, all under the session lock so frames leave in sequence order.
    pub(crate) async fn issue(
        &self,
        commands: Vec<Command>,
        listener: Option<Arc<dyn AgentListener>>,
        deadline: Option<Instant>,
        waiter: Option<AnswerSender>,
    ) -> Result<Sequence, DispatchError> {
        let agent_id = self.agent_id();
        let mut state = self.state.lock().await;
        if state.closed || !state.status.is_live() {
            return Err(DispatchError::AgentUnavailable(agent_id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let command_count = commands.len();
        if let Err(e) = self.link.send(AgentFrame::Request { seq, commands }) {
            tracing::warn!(agent_id, seq, error = %e, "Failed to write command batch");
            return Err(DispatchError::AgentUnavailable(agent_id));
        }

        state.pending.insert(
            seq,
            PendingRequest {
                seq,
                command_count,
                listener,
                submitted_at: Instant::now(),
                deadline,
                waiter,
            },
        );
        metrics::record_command_sent();
        Ok(seq)
    }

    pub(crate) async fn take_pending(&self, seq: Sequence) -> Option<PendingRequest> {
        self.state.lock().await.pending.remove(&seq)
    }

    /// Put back a request whose listener expects more answers. Dropped if
    /// the session closed in the meantime.
    pub(crate) async fn restore_pending(&self, request: PendingRequest) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.pending.insert(request.seq, request);
        true
    }

    /// Sequences whose deadline is at or before `now`
    pub(crate) async fn expired(&self, now: Instant) -> Vec<Sequence> {
        let state = self.state.lock().await;
        let mut seqs: Vec<Sequence> = state
            .pending
            .values()
            .filter(|p| p.deadline.is_some_and(|d| d <= now))
            .map(|p| p.seq)
            .collect();
        seqs.sort_unstable();
        seqs
    }

    /// Refresh last-heard and apply `event`. Returns (before, after).
    async fn touch(&self, event: StatusEvent) -> (Status, Status) {
        let mut state = self.state.lock().await;
        state.last_seen = Instant::now();
        let before = state.status;
        if let Some(next) = before.transition(event) {
            state.status = next;
        }
        (before, state.status)
    }

    async fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().await.last_seen)
    }

    async fn apply(&self, event: StatusEvent) -> Result<Status, ConnectError> {
        let mut state = self.state.lock().await;
        let next = state
            .status
            .transition(event)
            .ok_or(ConnectError::InvalidTransition {
                agent_id: self.agent_id(),
                status: state.status,
                event,
            })?;
        state.status = next;
        Ok(next)
    }

    /// Close the session: apply `event`, fail every pending request with
    /// `AgentUnavailable` and close the link. Returns the final status.
    async fn close(&self, event: StatusEvent) -> Status {
        let agent_id = self.agent_id();
        let (status, pending) = {
            let mut state = self.state.lock().await;
            state.closed = true;
            match state.status.transition(event) {
                Some(next) => state.status = next,
                None => tracing::debug!(
                    agent_id,
                    status = %state.status,
                    event = %event,
                    "Ignoring invalid transition on close"
                ),
            }
            let pending: Vec<PendingRequest> = state.pending.drain().map(|(_, p)| p).collect();
            (state.status, pending)
        };

        if !pending.is_empty() {
            tracing::info!(
                agent_id,
                cancelled = pending.len(),
                "Cancelling pending requests of closed session"
            );
        }
        for request in pending {
            if let Some(waiter) = request.waiter {
                let _ = waiter.send(Err(DispatchError::AgentUnavailable(agent_id)));
            }
        }

        self.link.close();
        status
    }
}

pub struct ConnectionRegistry {
    node_id: NodeId,
    sessions: RwLock<HashMap<AgentId, Arc<AgentSession>>>,
    hosts: Arc<dyn HostStore>,
    listeners: Arc<ListenerRegistry>,
    config: watch::Receiver<ManagerConfig>,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(
        node_id: NodeId,
        hosts: Arc<dyn HostStore>,
        listeners: Arc<ListenerRegistry>,
        config: watch::Receiver<ManagerConfig>,
    ) -> Self {
        Self {
            node_id,
            sessions: RwLock::new(HashMap::new()),
            hosts,
            listeners,
            config,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Accept an agent handshake
    ///
    /// Connect listeners run before the session exists; a rejection leaves
    /// no trace. A session already open for the agent is replaced and its
    /// pending requests fail with `AgentUnavailable`.
    pub async fn connect(
        &self,
        hello: AgentHello,
        link: Arc<dyn AgentLink>,
    ) -> Result<SessionInfo, ConnectError> {
        let agent_id = hello.agent_id;
        let mut existing = self.hosts.get_host(agent_id).await?;
        if existing.as_ref().and_then(|h| h.status) == Some(Status::Removed) {
            return Err(ConnectError::Rejected(format!(
                "host {agent_id} has been removed"
            )));
        }

        // The old session is gone before connect listeners hear of the new one
        let reconnect = self
            .end_session(agent_id, None, StatusEvent::AgentDisconnected)
            .await
            .is_some();
        if reconnect {
            tracing::info!(agent_id, "Agent reconnecting, previous session retired");
            existing = self.hosts.get_host(agent_id).await?;
        }
        let previous_status = existing.as_ref().and_then(|h| h.status);

        self.listeners
            .notify_connect(&hello, reconnect)
            .await
            .map_err(|e| ConnectError::Rejected(e.0))?;

        let connecting = previous_status
            .unwrap_or(Status::Creating)
            .transition(StatusEvent::AgentConnected)
            .unwrap_or(Status::Connecting);
        let status = connecting
            .transition(StatusEvent::Ready)
            .unwrap_or(connecting);

        let mut record = existing.unwrap_or_else(|| HostRecord {
            id: agent_id,
            name: hello.name.clone(),
            host_type: hello.host_type,
            status: None,
            resource_state: Some(ResourceState::Enabled),
            management_server_id: None,
            cluster_id: None,
            sub_cluster_id: None,
            auto_disabled: false,
        });
        record.name = hello.name.clone();
        record.host_type = hello.host_type;
        record.status = Some(status);
        record.management_server_id = Some(self.node_id);
        record.cluster_id = hello.cluster_id.or(record.cluster_id);
        record.sub_cluster_id = hello.sub_cluster_id.or(record.sub_cluster_id);
        self.hosts.upsert_host(record).await?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(AgentSession::new(hello, generation, status, link));
        let previous = {
            let mut sessions = self.sessions.write().await;
            let previous = sessions.insert(agent_id, session);
            metrics::set_agent_sessions(sessions.len());
            previous
        };

        // Only a concurrent handshake for the same agent gets here
        if let Some(previous) = previous {
            let old_status = previous.close(StatusEvent::AgentDisconnected).await;
            tracing::warn!(
                agent_id,
                old_generation = previous.generation(),
                generation,
                "Concurrent handshake replaced a session"
            );
            self.listeners.notify_disconnect(agent_id, old_status).await;
        }

        tracing::info!(agent_id, generation, status = %status, reconnect, "Agent connected");
        Ok(SessionInfo {
            agent_id,
            generation,
            status,
        })
    }

    /// Tear down the agent's current session
    pub async fn disconnect(&self, agent_id: AgentId, event: StatusEvent) -> Option<Status> {
        self.end_session(agent_id, None, event).await
    }

    /// Tear down the agent's session only if it is still `generation`
    pub async fn disconnect_session(
        &self,
        agent_id: AgentId,
        generation: u64,
        event: StatusEvent,
    ) -> Option<Status> {
        self.end_session(agent_id, Some(generation), event).await
    }

    async fn end_session(
        &self,
        agent_id: AgentId,
        generation: Option<u64>,
        event: StatusEvent,
    ) -> Option<Status> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let current = sessions.get(&agent_id)?;
            if generation.is_some_and(|g| g != current.generation()) {
                return None;
            }
            let session = sessions.remove(&agent_id)?;
            metrics::set_agent_sessions(sessions.len());
            session
        };

        let status = session.close(event).await;
        self.persist_status(agent_id, status).await;
        tracing::info!(
            agent_id,
            generation = session.generation(),
            event = %event,
            status = %status,
            "Agent session closed"
        );
        self.listeners.notify_disconnect(agent_id, status).await;
        Some(status)
    }

    async fn persist_status(&self, agent_id: AgentId, status: Status) {
        if let Err(e) = self.hosts.update_status(agent_id, status).await {
            tracing::warn!(agent_id, status = %status, error = %e, "Failed to persist status");
        }
    }

    /// Remove a host: its session is destroyed and its status becomes
    /// `Removed` for good.
    pub async fn remove(&self, agent_id: AgentId) -> Result<(), ConnectError> {
        self.end_session(agent_id, None, StatusEvent::Remove).await;
        self.hosts.update_status(agent_id, Status::Removed).await?;
        tracing::info!(agent_id, "Host removed");
        Ok(())
    }

    pub async fn session(&self, agent_id: AgentId) -> Option<Arc<AgentSession>> {
        self.sessions.read().await.get(&agent_id).cloned()
    }

    pub(crate) async fn sessions(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Live status of the agent, falling back to the stored one
    pub async fn status(&self, agent_id: AgentId) -> Result<Option<Status>, ConnectError> {
        if let Some(session) = self.session(agent_id).await {
            return Ok(Some(session.status().await));
        }
        Ok(self.hosts.get_host(agent_id).await?.and_then(|h| h.status))
    }

    pub async fn control_state(&self, agent_id: AgentId) -> Result<ControlState, ConnectError> {
        let host = self.hosts.get_host(agent_id).await?;
        let status = match self.session(agent_id).await {
            Some(session) => Some(session.status().await),
            None => host.as_ref().and_then(|h| h.status),
        };
        Ok(ControlState::resolve(
            status,
            host.and_then(|h| h.resource_state),
        ))
    }

    pub async fn connected_agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Handle a ping: refresh liveness, apply the health-check policy and
    /// fan the control command out.
    pub async fn record_ping(
        &self,
        agent_id: AgentId,
        healthy: Option<bool>,
    ) -> Result<Status, ConnectError> {
        self.ping(agent_id, None, healthy).await
    }

    /// Like `record_ping`, for a ping read from session `generation`. A
    /// ping from a replaced session is refused with `NotConnected`.
    pub async fn record_session_ping(
        &self,
        agent_id: AgentId,
        generation: u64,
        healthy: Option<bool>,
    ) -> Result<Status, ConnectError> {
        self.ping(agent_id, Some(generation), healthy).await
    }

    async fn ping(
        &self,
        agent_id: AgentId,
        generation: Option<u64>,
        healthy: Option<bool>,
    ) -> Result<Status, ConnectError> {
        let session = self
            .session(agent_id)
            .await
            .filter(|s| generation.is_none_or(|g| g == s.generation()))
            .ok_or(ConnectError::NotConnected(agent_id))?;

        let (before, after) = session.touch(StatusEvent::Ping).await;
        if before != after {
            tracing::info!(agent_id, from = %before, to = %after, "Agent status changed on ping");
            self.persist_status(agent_id, after).await;
        }

        if let Some(healthy) = healthy {
            self.apply_health(agent_id, session.sub_cluster_id(), healthy)
                .await?;
        }

        self.listeners
            .notify_control_command(agent_id, healthy)
            .await;
        Ok(after)
    }

    async fn apply_health(
        &self,
        agent_id: AgentId,
        sub_cluster_id: Option<u64>,
        healthy: bool,
    ) -> Result<(), ConnectError> {
        let enabled = self.config.borrow().auto_enable_disable_for(sub_cluster_id);
        if !enabled {
            return Ok(());
        }

        let Some(host) = self.hosts.get_host(agent_id).await? else {
            return Ok(());
        };
        if let Some(change) = health::evaluate(host.resource_state, host.auto_disabled, healthy) {
            self.hosts
                .update_resource_state(agent_id, change.resource_state, change.auto_disabled)
                .await?;
            tracing::info!(
                agent_id,
                healthy,
                resource_state = %change.resource_state,
                "Health check changed host intent"
            );
        }
        Ok(())
    }

    /// Move every session silent for longer than `timeout` to Alert and
    /// close it. Returns the affected agents.
    pub async fn investigate_stale(&self, now: Instant, timeout: Duration) -> Vec<AgentId> {
        let mut stale = Vec::new();
        for session in self.sessions().await {
            let silent = session.silent_for(now).await;
            if silent > timeout {
                stale.push((session.agent_id(), session.generation(), silent));
            }
        }

        let mut affected = Vec::with_capacity(stale.len());
        for (agent_id, generation, silent) in stale {
            tracing::warn!(
                agent_id,
                silent_secs = silent.as_secs(),
                "Agent missed its pings, investigating"
            );
            if self
                .disconnect_session(agent_id, generation, StatusEvent::PingTimeout)
                .await
                .is_some()
            {
                affected.push(agent_id);
            }
        }
        affected
    }

    /// Hand an agent to another node: mark it Rebalancing, release ownership,
    /// tell it where to go and close the session.
    pub async fn begin_rebalance(
        &self,
        agent_id: AgentId,
        management_servers: Vec<String>,
    ) -> Result<(), ConnectError> {
        let session = self
            .session(agent_id)
            .await
            .ok_or(ConnectError::NotConnected(agent_id))?;

        let status = session.apply(StatusEvent::StartAgentRebalance).await?;
        if let Some(mut host) = self.hosts.get_host(agent_id).await? {
            host.status = Some(status);
            host.management_server_id = None;
            self.hosts.upsert_host(host).await?;
        }

        if let Err(e) = session.link.send(AgentFrame::Migrate { management_servers }) {
            tracing::warn!(agent_id, error = %e, "Failed to send migrate frame");
        }

        self.disconnect_session(agent_id, session.generation(), StatusEvent::AgentDisconnected)
            .await;
        Ok(())
    }
}
