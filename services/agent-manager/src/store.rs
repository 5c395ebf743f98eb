// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Persistence boundary
//!
//! Host, job and node records are owned by an external store. The control
//! plane only reads and writes them through these traits. [`MemoryStore`]
//! implements all three in memory; it backs the binary and the tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use agent_control_types::{
    AgentId, HostRecord, HostType, JobId, JobRecord, ManagementServerNode, NodeId, NodeState,
    ResourceState, Status,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Host not found: {0}")]
    HostNotFound(AgentId),
    #[error("Backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait HostStore: Send + Sync {
    async fn get_host(&self, id: AgentId) -> Result<Option<HostRecord>, StoreError>;

    async fn upsert_host(&self, host: HostRecord) -> Result<(), StoreError>;

    async fn update_status(&self, id: AgentId, status: Status) -> Result<(), StoreError>;

    async fn update_resource_state(
        &self,
        id: AgentId,
        state: ResourceState,
        auto_disabled: bool,
    ) -> Result<(), StoreError>;

    /// Hosts of `host_type` whose owning node is `node`
    async fn list_hosts_owned_by(
        &self,
        node: NodeId,
        host_type: HostType,
    ) -> Result<Vec<HostRecord>, StoreError>;

    /// Ids of all non-removed hosts of `host_type`, ascending
    async fn list_host_ids(&self, host_type: HostType) -> Result<Vec<AgentId>, StoreError>;

    /// Number of non-removed hosts of `host_type` owned by any node
    async fn count_managed_hosts(&self, host_type: HostType) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Queued or running jobs, oldest first
    async fn list_unfinished_jobs(&self) -> Result<Vec<JobRecord>, StoreError>;
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<ManagementServerNode>, StoreError>;

    async fn upsert_node(&self, node: ManagementServerNode) -> Result<(), StoreError>;

    async fn count_up_nodes(&self) -> Result<usize, StoreError> {
        Ok(self
            .list_nodes()
            .await?
            .iter()
            .filter(|n| n.state == NodeState::Up)
            .count())
    }
}

#[derive(Default)]
struct MemoryTables {
    hosts: BTreeMap<AgentId, HostRecord>,
    jobs: HashMap<JobId, JobRecord>,
    nodes: BTreeMap<NodeId, ManagementServerNode>,
}

/// In-memory implementation of every store trait
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    async fn get_host(&self, id: AgentId) -> Result<Option<HostRecord>, StoreError> {
        Ok(self.tables.lock().await.hosts.get(&id).cloned())
    }

    async fn upsert_host(&self, host: HostRecord) -> Result<(), StoreError> {
        self.tables.lock().await.hosts.insert(host.id, host);
        Ok(())
    }

    async fn update_status(&self, id: AgentId, status: Status) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let host = tables
            .hosts
            .get_mut(&id)
            .ok_or(StoreError::HostNotFound(id))?;
        host.status = Some(status);
        Ok(())
    }

    async fn update_resource_state(
        &self,
        id: AgentId,
        state: ResourceState,
        auto_disabled: bool,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let host = tables
            .hosts
            .get_mut(&id)
            .ok_or(StoreError::HostNotFound(id))?;
        host.resource_state = Some(state);
        host.auto_disabled = auto_disabled;
        Ok(())
    }

    async fn list_hosts_owned_by(
        &self,
        node: NodeId,
        host_type: HostType,
    ) -> Result<Vec<HostRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .hosts
            .values()
            .filter(|h| h.host_type == host_type && h.management_server_id == Some(node))
            .cloned()
            .collect())
    }

    async fn list_host_ids(&self, host_type: HostType) -> Result<Vec<AgentId>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .hosts
            .values()
            .filter(|h| h.host_type == host_type && h.status != Some(Status::Removed))
            .map(|h| h.id)
            .collect())
    }

    async fn count_managed_hosts(&self, host_type: HostType) -> Result<usize, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .hosts
            .values()
            .filter(|h| {
                h.host_type == host_type
                    && h.management_server_id.is_some()
                    && h.status != Some(Status::Removed)
            })
            .count())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.tables.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs: Vec<JobRecord> = self
            .tables
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn list_nodes(&self) -> Result<Vec<ManagementServerNode>, StoreError> {
        Ok(self.tables.lock().await.nodes.values().cloned().collect())
    }

    async fn upsert_node(&self, node: ManagementServerNode) -> Result<(), StoreError> {
        self.tables.lock().await.nodes.insert(node.id, node);
        Ok(())
    }
}
