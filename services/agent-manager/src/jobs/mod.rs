// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Job execution for the agent manager
//!
//! Jobs mutate one entity each, named by their queue key. The
//! [`JobQueueManager`] runs at most one job per key at a time, in submission
//! order, on a bounded pool of workers. What a job actually does is up to the
//! named [`JobDispatcher`] it was submitted for.

pub mod queue;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use agent_control_types::{JobId, JobRecord, JobStatus};

use crate::store::StoreError;

pub use queue::JobQueueManager;

/// Job execution errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unknown dispatcher: {0}")]
    UnknownDispatcher(String),

    #[error("Job queue is shutting down")]
    ShuttingDown,

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {0} is not running")]
    NotRunning(JobId),

    #[error("Job cannot complete with status {0}")]
    InvalidStatus(JobStatus),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Final status and result of a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub result: Option<Value>,
}

impl JobOutcome {
    pub fn succeeded(result: Value) -> Self {
        Self {
            status: JobStatus::Succeeded,
            result: Some(result),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: Some(Value::String(reason.into())),
        }
    }
}

/// What a dispatcher reports when `dispatch` returns
#[derive(Debug, Clone, PartialEq)]
pub enum JobStep {
    /// The job is finished; the manager records the outcome
    Completed(JobOutcome),
    /// Work continues elsewhere; the dispatcher calls
    /// [`JobQueueManager::complete`] itself
    Pending,
}

/// Executor for one kind of job
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Name jobs are submitted under
    fn name(&self) -> &str;

    /// Run `job`. An `Err` or a panic fails the job.
    async fn dispatch(
        &self,
        job: JobRecord,
        queue: Arc<JobQueueManager>,
    ) -> Result<JobStep, JobError>;
}
