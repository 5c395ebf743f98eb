// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent manager
//!
//! Control plane for hypervisor agents connected to a cluster of
//! management-server nodes:
//!
//! - [`registry`] tracks one session per connected agent and its status
//! - [`dispatcher`] sends sequenced command batches and correlates answers
//! - [`listeners`] fans agent events out to registered listeners
//! - [`jobs`] runs long-lived work in per-key FIFO queues
//! - [`lb`] orders the management-server list handed to each agent
//! - [`rebalance`] moves agents off nodes owning more than their share
//! - [`transport`] speaks newline-delimited JSON frames over TCP

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod health;
pub mod jobs;
pub mod lb;
pub mod listeners;
pub mod metrics;
pub mod rebalance;
pub mod registry;
pub mod store;
pub mod transport;

pub use config::ManagerConfig;
pub use context::ManagerContext;
pub use dispatcher::{CommandDispatcher, DispatchError, Wait};
pub use jobs::{JobDispatcher, JobError, JobQueueManager};
pub use lb::{IndirectAgentLb, LbAlgorithmKind};
pub use listeners::{AgentListener, AnswerOutcome, Interest, ListenerRegistry};
pub use rebalance::{ClusterAgentRebalancer, OvershootPolicy};
pub use registry::{ConnectError, ConnectionRegistry};
pub use store::MemoryStore;
