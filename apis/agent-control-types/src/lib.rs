// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the agent control plane.
//!
//! This crate contains the data model used by the management-server nodes
//! (which own agent sessions, dispatch commands and run jobs) and by the
//! hypervisor/storage agents that connect to them: liveness and intent
//! enums, the derived control state, host and job records, and the frames
//! exchanged over an agent session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString, VariantNames};
use uuid::Uuid;

// ============================================================================
// Type Aliases
// ============================================================================

/// Agent (host) identifier
pub type AgentId = u64;

/// Management-server node identifier
pub type NodeId = u64;

/// Per-session sequence number correlating a command batch to its answers
pub type Sequence = u64;

/// Entity identity used to serialize job execution
pub type QueueKey = String;

/// Job identifier
pub type JobId = Uuid;

/// An opaque command payload. The control plane never looks inside.
pub type Command = Value;

// ============================================================================
// Host state
// ============================================================================

/// Observed connectivity state of an agent.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    VariantNames,
)]
pub enum Status {
    Creating,
    Connecting,
    Up,
    Down,
    Disconnected,
    Alert,
    Removed,
    Error,
    Rebalancing,
    Unknown,
}

/// Events that drive liveness transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
pub enum StatusEvent {
    /// Transport completed a handshake for the agent
    AgentConnected,
    /// Connect listeners accepted the agent
    Ready,
    /// The agent proved it is alive
    Ping,
    /// The agent has not been heard from within the ping timeout
    PingTimeout,
    /// The transport lost the session
    AgentDisconnected,
    /// The agent asked to shut down
    ShutdownRequested,
    /// The host has been confirmed down
    HostDown,
    /// Ownership of the agent is being handed to another node
    StartAgentRebalance,
    RebalanceCompleted,
    RebalanceFailed,
    /// The host is being removed from the system
    Remove,
    Error,
}

impl Status {
    /// Apply `event` to this status.
    ///
    /// Returns `None` when the event is not valid in this state; callers log
    /// and keep the current status. `Removed` is terminal.
    pub fn transition(self, event: StatusEvent) -> Option<Status> {
        use Status::*;
        use StatusEvent as E;

        if self == Removed {
            return None;
        }

        match (self, event) {
            (_, E::Remove) => Some(Removed),
            (_, E::Error) => Some(Error),
            (Rebalancing, E::AgentConnected) => Some(Connecting),
            (Rebalancing, E::RebalanceCompleted) => Some(Connecting),
            (Rebalancing, E::RebalanceFailed) => Some(Disconnected),
            (Rebalancing, E::AgentDisconnected) => Some(Rebalancing),
            (Rebalancing, _) => None,
            (_, E::AgentConnected) => Some(Connecting),
            (Creating | Connecting, E::Ready) => Some(Up),
            (Connecting, E::Ping) => Some(Connecting),
            (Up | Alert, E::Ping) => Some(Up),
            (Up, E::StartAgentRebalance) => Some(Rebalancing),
            (Alert, E::AgentDisconnected) => Some(Alert),
            (Down, E::AgentDisconnected) => Some(Down),
            (Error, E::AgentDisconnected) => Some(Error),
            (Creating | Connecting | Up | Disconnected | Unknown, E::AgentDisconnected) => {
                Some(Disconnected)
            }
            (Connecting | Up | Disconnected | Alert, E::PingTimeout) => Some(Alert),
            (Down, E::PingTimeout) => Some(Down),
            (Connecting | Up | Alert, E::ShutdownRequested) => Some(Disconnected),
            (Creating | Connecting | Up | Disconnected | Alert | Unknown, E::HostDown) => {
                Some(Down)
            }
            _ => None,
        }
    }

    /// Whether an agent in this state is considered reachable.
    pub fn is_live(self) -> bool {
        matches!(self, Status::Up | Status::Connecting | Status::Creating)
    }
}

/// Administrator-desired mode for a host, independent of liveness.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    VariantNames,
)]
pub enum ResourceState {
    Creating,
    Enabled,
    Disabled,
    Degraded,
    PrepareForMaintenance,
    ErrorInPrepareForMaintenance,
    ErrorInMaintenance,
    Maintenance,
    Error,
}

impl ResourceState {
    /// Whether this intent is one of the maintenance phases.
    pub fn is_maintenance(self) -> bool {
        matches!(
            self,
            ResourceState::Maintenance
                | ResourceState::PrepareForMaintenance
                | ResourceState::ErrorInPrepareForMaintenance
                | ResourceState::ErrorInMaintenance
        )
    }
}

/// Operational state derived from liveness and intent.
///
/// Never stored: always obtained through [`ControlState::resolve`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    VariantNames,
)]
pub enum ControlState {
    Enabled,
    Disabled,
    Maintenance,
    Offline,
    Unknown,
}

impl ControlState {
    /// Derive the control state of a host.
    ///
    /// Rules are evaluated in order and the first match wins. Total: every
    /// combination, including absent inputs, resolves to a state.
    pub fn resolve(status: Option<Status>, intent: Option<ResourceState>) -> ControlState {
        let (status, intent) = match (status, intent) {
            (Some(Status::Unknown) | None, _) | (_, None) => return ControlState::Unknown,
            (Some(s), Some(i)) => (s, i),
        };

        if intent.is_maintenance() {
            return ControlState::Maintenance;
        }

        match status {
            Status::Creating | Status::Connecting | Status::Up => match intent {
                ResourceState::Enabled => ControlState::Enabled,
                _ => ControlState::Disabled,
            },
            _ => ControlState::Offline,
        }
    }
}

/// Kind of agent behind a host record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    VariantNames,
)]
pub enum HostType {
    /// Hypervisor hosts; the only kind that takes part in agent rebalancing
    Routing,
    Storage,
    SecondaryStorage,
    ConsoleProxy,
}

/// The minimal host record the control plane reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: AgentId,
    pub name: String,
    pub host_type: HostType,
    pub status: Option<Status>,
    pub resource_state: Option<ResourceState>,
    /// Management-server node currently owning the agent
    pub management_server_id: Option<NodeId>,
    pub cluster_id: Option<u64>,
    /// Finer grouping beneath a node; the atomic unit of rebalancing
    pub sub_cluster_id: Option<u64>,
    /// Set when the health-check policy, not an administrator, disabled the host
    #[serde(default)]
    pub auto_disabled: bool,
}

impl HostRecord {
    pub fn control_state(&self) -> ControlState {
        ControlState::resolve(self.status, self.resource_state)
    }
}

// ============================================================================
// Management-server nodes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Up,
    Down,
}

/// A member of the management-server cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementServerNode {
    pub id: NodeId,
    pub address: String,
    pub state: NodeState,
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// A job as seen through the persistence boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue_key: QueueKey,
    /// Name of the dispatcher that executes the job
    pub dispatcher: String,
    pub payload: Value,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Agent wire frames
// ============================================================================

/// One answer per command, matched to its command by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "details", rename_all = "snake_case")]
pub enum Answer {
    Success(Value),
    Failure(String),
    /// Nobody on the receiving side knows how to execute the command
    Unsupported(String),
}

impl Answer {
    pub fn is_success(&self) -> bool {
        matches!(self, Answer::Success(_))
    }
}

/// Handshake sent by an agent as the first frame of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHello {
    pub agent_id: AgentId,
    pub name: String,
    pub host_type: HostType,
    #[serde(default)]
    pub cluster_id: Option<u64>,
    #[serde(default)]
    pub sub_cluster_id: Option<u64>,
    pub version: String,
}

/// Frames exchanged over an agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Hello(AgentHello),
    /// A command batch issued under one sequence number
    Request {
        seq: Sequence,
        commands: Vec<Command>,
    },
    /// The answer batch for `seq`, same length and order as the request
    Response {
        seq: Sequence,
        answers: Vec<Answer>,
    },
    Ping {
        #[serde(default)]
        healthy: Option<bool>,
    },
    /// Preference-ordered management servers to fall back on
    ManagementServerList {
        management_servers: Vec<String>,
    },
    /// Ask the agent to reconnect using this preference-ordered list
    Migrate {
        management_servers: Vec<String>,
    },
    Close {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen, quickcheck};
    use strum::IntoEnumIterator;

    impl Arbitrary for Status {
        fn arbitrary(g: &mut Gen) -> Self {
            let all: Vec<Status> = Status::iter().collect();
            *g.choose(&all).unwrap_or(&Status::Unknown)
        }
    }

    impl Arbitrary for ResourceState {
        fn arbitrary(g: &mut Gen) -> Self {
            let all: Vec<ResourceState> = ResourceState::iter().collect();
            *g.choose(&all).unwrap_or(&ResourceState::Enabled)
        }
    }

    #[test]
    fn control_state_examples() {
        assert_eq!(ControlState::resolve(None, None), ControlState::Unknown);
        assert_eq!(
            ControlState::resolve(Some(Status::Up), Some(ResourceState::Enabled)),
            ControlState::Enabled
        );
        assert_eq!(
            ControlState::resolve(Some(Status::Up), Some(ResourceState::PrepareForMaintenance)),
            ControlState::Maintenance
        );
        assert_eq!(
            ControlState::resolve(Some(Status::Down), Some(ResourceState::Enabled)),
            ControlState::Offline
        );
        assert_eq!(
            ControlState::resolve(Some(Status::Connecting), Some(ResourceState::Disabled)),
            ControlState::Disabled
        );
    }

    #[test]
    fn control_state_unknown_inputs() {
        assert_eq!(
            ControlState::resolve(Some(Status::Unknown), Some(ResourceState::Enabled)),
            ControlState::Unknown
        );
        assert_eq!(
            ControlState::resolve(Some(Status::Up), None),
            ControlState::Unknown
        );
        assert_eq!(
            ControlState::resolve(None, Some(ResourceState::Maintenance)),
            ControlState::Unknown
        );
        // Unknown liveness wins over a maintenance intent
        assert_eq!(
            ControlState::resolve(Some(Status::Unknown), Some(ResourceState::Maintenance)),
            ControlState::Unknown
        );
    }

    #[test]
    fn control_state_maintenance_ignores_liveness() {
        for status in Status::iter().filter(|s| *s != Status::Unknown) {
            for intent in ResourceState::iter().filter(|i| i.is_maintenance()) {
                assert_eq!(
                    ControlState::resolve(Some(status), Some(intent)),
                    ControlState::Maintenance,
                    "{status} / {intent}"
                );
            }
        }
    }

    #[test]
    fn control_state_offline_regardless_of_intent() {
        let offline = [
            Status::Down,
            Status::Disconnected,
            Status::Alert,
            Status::Removed,
            Status::Error,
            Status::Rebalancing,
        ];
        for status in offline {
            for intent in [ResourceState::Enabled, ResourceState::Disabled] {
                assert_eq!(
                    ControlState::resolve(Some(status), Some(intent)),
                    ControlState::Offline
                );
            }
        }
    }

    #[test]
    fn control_state_disabled_intents() {
        for status in [Status::Creating, Status::Connecting, Status::Up] {
            for intent in [
                ResourceState::Creating,
                ResourceState::Disabled,
                ResourceState::Error,
                ResourceState::Degraded,
            ] {
                assert_eq!(
                    ControlState::resolve(Some(status), Some(intent)),
                    ControlState::Disabled
                );
            }
        }
    }

    quickcheck! {
        fn control_state_is_total(status: Option<Status>, intent: Option<ResourceState>) -> bool {
            let state = ControlState::resolve(status, intent);
            ControlState::iter().any(|s| s == state)
                && state == ControlState::resolve(status, intent)
        }
    }

    #[test]
    fn status_connect_and_ready() {
        let s = Status::Disconnected
            .transition(StatusEvent::AgentConnected)
            .unwrap();
        assert_eq!(s, Status::Connecting);
        assert_eq!(s.transition(StatusEvent::Ready), Some(Status::Up));
    }

    #[test]
    fn status_removed_is_terminal() {
        for event in StatusEvent::iter() {
            assert_eq!(Status::Removed.transition(event), None);
        }
    }

    #[test]
    fn status_rebalancing_survives_disconnect() {
        let s = Status::Up
            .transition(StatusEvent::StartAgentRebalance)
            .unwrap();
        assert_eq!(s, Status::Rebalancing);
        assert_eq!(
            s.transition(StatusEvent::AgentDisconnected),
            Some(Status::Rebalancing)
        );
        assert_eq!(s.transition(StatusEvent::Ready), None);
        assert_eq!(
            s.transition(StatusEvent::AgentConnected),
            Some(Status::Connecting)
        );
    }

    #[test]
    fn status_ping_timeout_and_recovery() {
        let s = Status::Up.transition(StatusEvent::PingTimeout).unwrap();
        assert_eq!(s, Status::Alert);
        assert_eq!(s.transition(StatusEvent::Ping), Some(Status::Up));
        assert_eq!(Status::Disconnected.transition(StatusEvent::Ping), None);
    }

    #[test]
    fn status_from_str() {
        assert_eq!("Up".parse::<Status>().unwrap(), Status::Up);
        assert!("up-ish".parse::<Status>().is_err());
        assert_eq!(
            "ErrorInMaintenance".parse::<ResourceState>().unwrap(),
            ResourceState::ErrorInMaintenance
        );
    }

    #[test]
    fn job_status_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert_eq!(JobStatus::Succeeded.to_string(), "succeeded");
    }

    #[test]
    fn test_frame_serialization() {
        let frame = AgentFrame::Request {
            seq: 7,
            commands: vec![serde_json::json!({"StartVm": {"name": "i-2-10"}})],
        };
        let json = serde_json::to_string(&frame).expect("serialize request");
        assert!(json.contains(r#""type":"request""#));
        assert!(json.contains(r#""seq":7"#));

        let hello = r#"{"type":"hello","agent_id":5,"name":"kvm-5","host_type":"Routing","version":"4.19"}"#;
        match serde_json::from_str::<AgentFrame>(hello).expect("parse hello") {
            AgentFrame::Hello(h) => {
                assert_eq!(h.agent_id, 5);
                assert_eq!(h.host_type, HostType::Routing);
                assert_eq!(h.sub_cluster_id, None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let ping: AgentFrame = serde_json::from_str(r#"{"type":"ping"}"#).expect("parse ping");
        assert_eq!(ping, AgentFrame::Ping { healthy: None });
    }

    #[test]
    fn test_answer_serialization() {
        let answer = Answer::Failure("no such vm".to_string());
        let json = serde_json::to_string(&answer).expect("serialize answer");
        assert_eq!(json, r#"{"result":"failure","details":"no such vm"}"#);
        assert!(!answer.is_success());
        assert!(Answer::Success(Value::Null).is_success());
    }
}
