// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Indirect agent load balancing
//!
//! Agents are handed an ordered list of management-server addresses and try
//! them in order. The algorithm that orders the list is chosen by name from
//! an [`LbAlgorithms`] registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;
use tokio::sync::watch;

use agent_control_types::{AgentId, HostType};

use crate::config::ManagerConfig;
use crate::registry::{AgentSession, ConnectionRegistry};
use crate::store::{HostStore, StoreError};

#[derive(Debug, Error)]
pub enum LbError {
    #[error("Unknown LB algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Names of the built-in algorithms
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LbAlgorithmKind {
    Static,
    RoundRobin,
    Shuffle,
}

pub trait IndirectAgentLbAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Preference-ordered management servers for `host_id`
    fn sort(&self, nodes: &[String], known_hosts: &[AgentId], host_id: AgentId) -> Vec<String>;

    /// Whether two computed lists are equivalent
    fn compare(&self, a: &[String], b: &[String]) -> bool;
}

/// Nodes in configured order
pub struct StaticLb;

impl IndirectAgentLbAlgorithm for StaticLb {
    fn name(&self) -> &'static str {
        "static"
    }

    fn sort(&self, nodes: &[String], _known_hosts: &[AgentId], _host_id: AgentId) -> Vec<String> {
        nodes.to_vec()
    }

    fn compare(&self, a: &[String], b: &[String]) -> bool {
        a == b
    }
}

/// Nodes rotated by the host's position among all known host ids
///
/// A host missing from `known_hosts` takes the position it would have once
/// inserted, so appending new hosts never moves existing ones.
pub struct RoundRobinLb;

impl IndirectAgentLbAlgorithm for RoundRobinLb {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn sort(&self, nodes: &[String], known_hosts: &[AgentId], host_id: AgentId) -> Vec<String> {
        if nodes.is_empty() {
            return Vec::new();
        }

        let mut hosts = known_hosts.to_vec();
        hosts.sort_unstable();
        hosts.dedup();
        let index = hosts.binary_search(&host_id).unwrap_or_else(|i| i);

        let mut sorted = nodes.to_vec();
        sorted.rotate_left(index % nodes.len());
        sorted
    }

    fn compare(&self, a: &[String], b: &[String]) -> bool {
        a == b
    }
}

/// A fresh random permutation per call
pub struct ShuffleLb;

impl IndirectAgentLbAlgorithm for ShuffleLb {
    fn name(&self) -> &'static str {
        "shuffle"
    }

    fn sort(&self, nodes: &[String], _known_hosts: &[AgentId], _host_id: AgentId) -> Vec<String> {
        let mut shuffled = nodes.to_vec();
        shuffled.shuffle(&mut rand::rng());
        shuffled
    }

    fn compare(&self, a: &[String], b: &[String]) -> bool {
        a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
    }
}

/// Algorithms selectable by name
pub struct LbAlgorithms {
    algorithms: HashMap<String, Arc<dyn IndirectAgentLbAlgorithm>>,
}

impl Default for LbAlgorithms {
    fn default() -> Self {
        let mut registry = Self {
            algorithms: HashMap::new(),
        };
        registry.register(Arc::new(StaticLb));
        registry.register(Arc::new(RoundRobinLb));
        registry.register(Arc::new(ShuffleLb));
        registry
    }
}

impl LbAlgorithms {
    pub fn register(&mut self, algorithm: Arc<dyn IndirectAgentLbAlgorithm>) {
        self.algorithms
            .insert(algorithm.name().to_string(), algorithm);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn IndirectAgentLbAlgorithm>, LbError> {
        self.algorithms
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| LbError::UnknownAlgorithm(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.algorithms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Computes management-server lists for hosts from the live configuration
pub struct IndirectAgentLb {
    algorithms: LbAlgorithms,
    hosts: Arc<dyn HostStore>,
    config: watch::Receiver<ManagerConfig>,
}

impl IndirectAgentLb {
    pub fn new(
        algorithms: LbAlgorithms,
        hosts: Arc<dyn HostStore>,
        config: watch::Receiver<ManagerConfig>,
    ) -> Self {
        Self {
            algorithms,
            hosts,
            config,
        }
    }

    fn current(&self) -> Result<(Arc<dyn IndirectAgentLbAlgorithm>, Vec<String>), LbError> {
        let config = self.config.borrow();
        let algorithm = self.algorithms.get(&config.lb_algorithm.to_string())?;
        Ok((algorithm, config.management_servers.clone()))
    }

    /// Preference-ordered management servers for `host_id`
    pub async fn management_server_list(&self, host_id: AgentId) -> Result<Vec<String>, LbError> {
        let (algorithm, nodes) = self.current()?;
        let known = self.hosts.list_host_ids(HostType::Routing).await?;
        Ok(algorithm.sort(&nodes, &known, host_id))
    }

    /// The host's list with `avoid` moved last, used when handing a host
    /// away from that node
    pub async fn list_avoiding(&self, host_id: AgentId, avoid: &str) -> Result<Vec<String>, LbError> {
        let mut list = self.management_server_list(host_id).await?;
        if let Some(pos) = list.iter().position(|a| a == avoid) {
            let node = list.remove(pos);
            list.push(node);
        }
        Ok(list)
    }

    /// Whether a recomputed list differs from the one the host already has
    pub fn has_changed(&self, previous: &[String], current: &[String]) -> Result<bool, LbError> {
        let (algorithm, _) = self.current()?;
        Ok(!algorithm.compare(previous, current))
    }

    /// Compute the session's list and send it if the agent has none yet or
    /// holds a different one. Returns whether it was sent.
    pub async fn publish(&self, session: &AgentSession) -> Result<bool, LbError> {
        let agent_id = session.agent_id();
        let (algorithm, _) = self.current()?;
        let list = self.management_server_list(agent_id).await?;
        let sent = session
            .offer_servers(list, |previous, current| !algorithm.compare(previous, current))
            .await;
        if sent {
            tracing::debug!(agent_id, algorithm = algorithm.name(), "Sent management server list");
        }
        Ok(sent)
    }

    /// Recompute every connected agent's list, sending the ones that
    /// changed. Returns how many were sent.
    pub async fn refresh_all(&self, registry: &ConnectionRegistry) -> Result<usize, LbError> {
        let mut sent = 0;
        for session in registry.sessions().await {
            if self.publish(&session).await? {
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::info!(sent, "Refreshed management server lists");
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::listeners::ListenerRegistry;
    use crate::transport::{ChannelLink, Outbound};
    use agent_control_types::{AgentFrame, AgentHello, HostRecord, ResourceState, Status};
    use quickcheck::{TestResult, quickcheck};
    use tokio::sync::mpsc;

    const HOSTS: [AgentId; 8] = [1, 5, 10, 20, 50, 60, 70, 80];

    fn nodes() -> Vec<String> {
        vec![
            "10.1.1.1".to_string(),
            "10.1.1.2".to_string(),
            "10.1.1.3".to_string(),
        ]
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn rotate(list: &[String], by: usize) -> Vec<String> {
        let mut rotated = list.to_vec();
        rotated.rotate_left(by % list.len());
        rotated
    }

    #[test]
    fn kind_parses_by_name() {
        assert_eq!("static".parse::<LbAlgorithmKind>().unwrap(), LbAlgorithmKind::Static);
        assert_eq!(
            "RoundRobin".parse::<LbAlgorithmKind>().unwrap(),
            LbAlgorithmKind::RoundRobin
        );
        assert_eq!(LbAlgorithmKind::RoundRobin.to_string(), "roundrobin");
        assert!("random".parse::<LbAlgorithmKind>().is_err());
    }

    #[test]
    fn registry_resolves_every_kind() {
        use strum::IntoEnumIterator;

        let registry = LbAlgorithms::default();
        for kind in LbAlgorithmKind::iter() {
            assert_eq!(registry.get(&kind.to_string()).unwrap().name(), kind.to_string());
        }
        assert_eq!(registry.names(), vec!["roundrobin", "shuffle", "static"]);
        assert!(matches!(registry.get("weighted"), Err(LbError::UnknownAlgorithm(_))));
    }

    #[test]
    fn static_keeps_order() {
        assert_eq!(StaticLb.sort(&nodes(), &HOSTS, 5), nodes());
        assert!(StaticLb.compare(&nodes(), &nodes()));
        assert!(!StaticLb.compare(&strings(&["a", "b"]), &strings(&["b", "a"])));
    }

    #[test]
    fn roundrobin_rotates_by_position() {
        // Positions 0..8 rotate by 0,1,2,0,1,2,0,1
        for (pos, host) in HOSTS.iter().enumerate() {
            assert_eq!(RoundRobinLb.sort(&nodes(), &HOSTS, *host), rotate(&nodes(), pos));
        }
        assert!(!RoundRobinLb.compare(&strings(&["a", "b"]), &strings(&["b", "a"])));
    }

    #[test]
    fn roundrobin_new_host_is_one_step_after_last() {
        let last = RoundRobinLb.sort(&nodes(), &HOSTS, 80);
        let new = RoundRobinLb.sort(&nodes(), &HOSTS, 100);
        assert_eq!(new, rotate(&last, 1));
        assert_ne!(new, last);
    }

    #[test]
    fn roundrobin_adding_host_moves_few_existing_hosts() {
        let mut grown = HOSTS.to_vec();
        grown.push(100);

        let moved = HOSTS
            .iter()
            .filter(|h| RoundRobinLb.sort(&nodes(), &HOSTS, **h) != RoundRobinLb.sort(&nodes(), &grown, **h))
            .count();
        assert!(moved <= HOSTS.len().div_ceil(nodes().len()));
    }

    #[test]
    fn roundrobin_empty_nodes() {
        assert!(RoundRobinLb.sort(&[], &HOSTS, 1).is_empty());
    }

    #[test]
    fn shuffle_compares_as_sets() {
        assert!(ShuffleLb.compare(&strings(&["a", "b", "c"]), &strings(&["c", "a", "b"])));
        assert!(!ShuffleLb.compare(&strings(&["a", "b"]), &strings(&["a", "c"])));
        assert!(!ShuffleLb.compare(&strings(&["a", "b"]), &strings(&["a", "b", "c"])));
        // Duplicates do not matter, only membership
        assert!(ShuffleLb.compare(&strings(&["a", "a", "b"]), &strings(&["a", "b", "b"])));
    }

    quickcheck! {
        fn static_is_identity(nodes: Vec<String>, hosts: Vec<AgentId>, host: AgentId) -> bool {
            StaticLb.sort(&nodes, &hosts, host) == nodes
        }

        fn roundrobin_is_stable_rotation(nodes: Vec<String>, hosts: Vec<AgentId>, host: AgentId) -> TestResult {
            if nodes.is_empty() {
                return TestResult::discard();
            }
            let first = RoundRobinLb.sort(&nodes, &hosts, host);
            let again = RoundRobinLb.sort(&nodes, &hosts, host);
            let is_rotation = (0..nodes.len()).any(|k| rotate(&nodes, k) == first);
            TestResult::from_bool(first == again && is_rotation)
        }

        fn shuffle_is_permutation(nodes: Vec<String>) -> bool {
            let shuffled = ShuffleLb.sort(&nodes, &[], 0);
            ShuffleLb.compare(&nodes, &shuffled)
        }
    }

    #[tokio::test]
    async fn service_follows_config_reload() {
        let store = Arc::new(MemoryStore::new());
        for id in HOSTS {
            store
                .upsert_host(HostRecord {
                    id,
                    name: format!("kvm-{id}"),
                    host_type: HostType::Routing,
                    status: Some(Status::Up),
                    resource_state: Some(ResourceState::Enabled),
                    management_server_id: Some(1),
                    cluster_id: Some(1),
                    sub_cluster_id: Some(1),
                    auto_disabled: false,
                })
                .await
                .unwrap();
        }

        let config = ManagerConfig {
            management_servers: nodes(),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(config.clone());
        let lb = IndirectAgentLb::new(LbAlgorithms::default(), store, rx);

        assert_eq!(lb.management_server_list(10).await.unwrap(), nodes());

        let mut reloaded = config;
        reloaded.lb_algorithm = LbAlgorithmKind::RoundRobin;
        tx.send(reloaded).unwrap();

        let list = lb.management_server_list(10).await.unwrap();
        assert_eq!(list, rotate(&nodes(), 2));
        assert!(lb.has_changed(&nodes(), &list).unwrap());
        assert!(!lb.has_changed(&list, &list).unwrap());

        let avoiding = lb.list_avoiding(10, "10.1.1.3").await.unwrap();
        assert_eq!(avoiding.last().map(String::as_str), Some("10.1.1.3"));
    }

    fn routing_host(id: AgentId) -> HostRecord {
        HostRecord {
            id,
            name: format!("kvm-{id}"),
            host_type: HostType::Routing,
            status: Some(Status::Up),
            resource_state: Some(ResourceState::Enabled),
            management_server_id: Some(1),
            cluster_id: Some(1),
            sub_cluster_id: Some(1),
            auto_disabled: false,
        }
    }

    fn sent_lists(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Vec<String>> {
        let mut lists = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(AgentFrame::ManagementServerList { management_servers }) = item {
                lists.push(management_servers);
            }
        }
        lists
    }

    #[tokio::test]
    async fn lists_are_pushed_once_and_again_only_when_changed() {
        let store = Arc::new(MemoryStore::new());
        for id in [1, 5] {
            store.upsert_host(routing_host(id)).await.unwrap();
        }
        let config = ManagerConfig {
            management_servers: strings(&["a", "b", "c"]),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(config.clone());
        let registry = ConnectionRegistry::new(
            1,
            Arc::clone(&store) as Arc<dyn HostStore>,
            Arc::new(ListenerRegistry::new()),
            rx.clone(),
        );
        let lb = IndirectAgentLb::new(LbAlgorithms::default(), store, rx);

        let (link, mut frames) = ChannelLink::new();
        registry
            .connect(
                AgentHello {
                    agent_id: 10,
                    name: "kvm-10".to_string(),
                    host_type: HostType::Routing,
                    cluster_id: Some(1),
                    sub_cluster_id: Some(1),
                    version: "1.0".to_string(),
                },
                Arc::new(link),
            )
            .await
            .unwrap();
        let session = registry.session(10).await.unwrap();

        assert!(lb.publish(&session).await.unwrap());
        assert_eq!(sent_lists(&mut frames), vec![strings(&["a", "b", "c"])]);
        assert!(!lb.publish(&session).await.unwrap());
        assert_eq!(lb.refresh_all(&registry).await.unwrap(), 0);
        assert!(sent_lists(&mut frames).is_empty());

        // Host 10 sits third among 1, 5, 10
        let mut reloaded = config;
        reloaded.lb_algorithm = LbAlgorithmKind::RoundRobin;
        tx.send(reloaded).unwrap();
        assert_eq!(lb.refresh_all(&registry).await.unwrap(), 1);
        assert_eq!(sent_lists(&mut frames), vec![strings(&["c", "a", "b"])]);
        assert_eq!(
            session.assigned_servers().await,
            Some(strings(&["c", "a", "b"]))
        );
    }
}
