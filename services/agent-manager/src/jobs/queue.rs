// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Per-key job queue
//!
//! All queue bookkeeping lives under one mutex, so marking a key busy on
//! submit and handing the key to the next job on completion can never
//! interleave. Dispatch itself runs outside the lock on a pool of
//! `job_workers` permits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore, watch};
use uuid::Uuid;

use agent_control_types::{JobId, JobRecord, JobStatus, QueueKey};

use super::{JobDispatcher, JobError, JobOutcome, JobStep};
use crate::metrics;
use crate::store::JobStore;

struct JobEntry {
    record: JobRecord,
    done: watch::Sender<JobStatus>,
}

struct QueueState {
    jobs: HashMap<JobId, JobEntry>,
    /// Keys with a running job
    running: HashMap<QueueKey, JobId>,
    /// Jobs waiting for their key, in submission order
    waiting: HashMap<QueueKey, VecDeque<JobId>>,
    accepting: bool,
}

impl QueueState {
    fn mark_running(&mut self, id: JobId) -> Option<JobRecord> {
        let entry = self.jobs.get_mut(&id)?;
        entry.record.status = JobStatus::Running;
        entry.record.updated_at = Utc::now();
        entry.done.send_replace(JobStatus::Running);
        self.running.insert(entry.record.queue_key.clone(), id);
        Some(entry.record.clone())
    }

    /// Admit a job: run it now if its key is free, otherwise queue it
    fn enqueue(&mut self, record: JobRecord) -> Option<JobRecord> {
        let id = record.id;
        let key = record.queue_key.clone();
        let (done, _) = watch::channel(JobStatus::Queued);
        self.jobs.insert(id, JobEntry { record, done });

        if self.running.contains_key(&key) {
            self.waiting.entry(key).or_default().push_back(id);
            None
        } else {
            self.mark_running(id)
        }
    }

    /// Release `key` and hand it to the next waiting job, if any
    fn promote_next(&mut self, key: &QueueKey) -> Option<JobRecord> {
        self.running.remove(key);
        if !self.accepting {
            return None;
        }
        let queue = self.waiting.get_mut(key)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(key);
        }
        self.mark_running(next?)
    }
}

pub struct JobQueueManager {
    state: Mutex<QueueState>,
    dispatchers: RwLock<HashMap<String, Arc<dyn JobDispatcher>>>,
    workers: Arc<Semaphore>,
    store: Arc<dyn JobStore>,
    running_count: watch::Sender<usize>,
}

impl JobQueueManager {
    pub fn new(store: Arc<dyn JobStore>, workers: usize) -> Self {
        let (running_count, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                running: HashMap::new(),
                waiting: HashMap::new(),
                accepting: true,
            }),
            dispatchers: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            store,
            running_count,
        }
    }

    pub async fn register_dispatcher(&self, dispatcher: Arc<dyn JobDispatcher>) {
        let name = dispatcher.name().to_string();
        tracing::info!(dispatcher = %name, "Registered job dispatcher");
        self.dispatchers.write().await.insert(name, dispatcher);
    }

    async fn persist(&self, record: &JobRecord) {
        if let Err(e) = self.store.save_job(record).await {
            tracing::warn!(job_id = %record.id, error = %e, "Failed to persist job");
        }
    }

    /// Submit a job. Returns immediately; the job runs once its key is free.
    pub async fn submit(
        self: &Arc<Self>,
        queue_key: impl Into<QueueKey>,
        dispatcher: &str,
        payload: Value,
    ) -> Result<JobId, JobError> {
        if !self.dispatchers.read().await.contains_key(dispatcher) {
            return Err(JobError::UnknownDispatcher(dispatcher.to_string()));
        }

        let now = Utc::now();
        let record = JobRecord {
            id: Uuid::new_v4(),
            queue_key: queue_key.into(),
            dispatcher: dispatcher.to_string(),
            payload,
            status: JobStatus::Queued,
            result: None,
            created_at: now,
            updated_at: now,
        };
        let id = record.id;

        let (start, snapshot) = {
            let mut state = self.state.lock().await;
            if !state.accepting {
                return Err(JobError::ShuttingDown);
            }
            let start = state.enqueue(record.clone());
            self.running_count.send_replace(state.running.len());
            (start, record)
        };

        tracing::info!(
            job_id = %id,
            queue_key = %snapshot.queue_key,
            dispatcher = %dispatcher,
            started = start.is_some(),
            "Job submitted"
        );

        match start {
            Some(running) => {
                self.persist(&running).await;
                self.spawn(running);
            }
            None => self.persist(&snapshot).await,
        }
        Ok(id)
    }

    /// Finish a running job and start the next one queued for its key
    pub async fn complete(
        self: &Arc<Self>,
        job_id: JobId,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<(), JobError> {
        if !status.is_terminal() {
            return Err(JobError::InvalidStatus(status));
        }

        let (finished, next) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.jobs.get_mut(&job_id) else {
                drop(state);
                return match self.store.get_job(job_id).await? {
                    Some(_) => Err(JobError::NotRunning(job_id)),
                    None => Err(JobError::NotFound(job_id)),
                };
            };
            if entry.record.status != JobStatus::Running {
                return Err(JobError::NotRunning(job_id));
            }
            entry.record.status = status;
            entry.record.result = result;
            entry.record.updated_at = Utc::now();
            entry.done.send_replace(status);
            let finished = entry.record.clone();

            let next = state.promote_next(&finished.queue_key);
            self.running_count.send_replace(state.running.len());
            (finished, next)
        };

        metrics::record_job_finished(&status.to_string());
        tracing::info!(
            job_id = %job_id,
            queue_key = %finished.queue_key,
            status = %status,
            "Job finished"
        );
        self.persist(&finished).await;
        // Finished jobs are served from the store from here on
        self.state.lock().await.jobs.remove(&job_id);

        if let Some(next) = next {
            self.persist(&next).await;
            self.spawn(next);
        }
        Ok(())
    }

    fn spawn(self: &Arc<Self>, job: JobRecord) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&manager.workers).acquire_owned().await else {
                return;
            };
            let id = job.id;

            let dispatcher = manager.dispatchers.read().await.get(&job.dispatcher).cloned();
            let outcome = match dispatcher {
                None => Some(JobOutcome::failed(format!(
                    "unknown dispatcher {}",
                    job.dispatcher
                ))),
                Some(dispatcher) => {
                    let queue = Arc::clone(&manager);
                    // Own task so a panicking dispatcher only fails its job
                    let task = tokio::spawn(async move { dispatcher.dispatch(job, queue).await });
                    match task.await {
                        Ok(Ok(JobStep::Completed(outcome))) => Some(outcome),
                        Ok(Ok(JobStep::Pending)) => None,
                        Ok(Err(e)) => Some(JobOutcome::failed(e.to_string())),
                        Err(e) if e.is_panic() => {
                            tracing::error!(job_id = %id, "Job dispatcher panicked");
                            Some(JobOutcome::failed("dispatcher panicked"))
                        }
                        Err(e) => Some(JobOutcome::failed(e.to_string())),
                    }
                }
            };

            if let Some(outcome) = outcome {
                if let Err(e) = manager.complete(id, outcome.status, outcome.result).await {
                    tracing::warn!(job_id = %id, error = %e, "Failed to complete job");
                }
            }
        });
    }

    /// Current view of a job
    pub async fn job(&self, job_id: JobId) -> Result<JobRecord, JobError> {
        if let Some(entry) = self.state.lock().await.jobs.get(&job_id) {
            return Ok(entry.record.clone());
        }
        self.store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Wait until the job reaches a terminal status
    pub async fn wait_for(&self, job_id: JobId) -> Result<JobRecord, JobError> {
        let rx = {
            let state = self.state.lock().await;
            state.jobs.get(&job_id).map(|e| e.done.subscribe())
        };
        if let Some(mut rx) = rx {
            // Err only once the entry is archived, after its terminal status
            let _ = rx.wait_for(|s| s.is_terminal()).await;
        }
        self.job(job_id).await
    }

    /// Jobs held in memory: queued, running, or finishing
    pub async fn tracked_jobs(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    /// Job running for `queue_key`, if any
    pub async fn running_job(&self, queue_key: &str) -> Option<JobId> {
        self.state.lock().await.running.get(queue_key).copied()
    }

    pub async fn queued_count(&self, queue_key: &str) -> usize {
        self.state
            .lock()
            .await
            .waiting
            .get(queue_key)
            .map_or(0, VecDeque::len)
    }

    /// Re-admit jobs left Queued or Running by a previous process, oldest
    /// first. Returns how many were admitted.
    pub async fn resume_unfinished(self: &Arc<Self>) -> Result<usize, JobError> {
        let unfinished = self.store.list_unfinished_jobs().await?;
        let mut admitted = 0;

        for mut record in unfinished {
            if !self.dispatchers.read().await.contains_key(&record.dispatcher) {
                tracing::warn!(
                    job_id = %record.id,
                    dispatcher = %record.dispatcher,
                    "Cannot resume job without its dispatcher"
                );
                continue;
            }

            record.status = JobStatus::Queued;
            let start = {
                let mut state = self.state.lock().await;
                if state.jobs.contains_key(&record.id) {
                    continue;
                }
                let start = state.enqueue(record);
                self.running_count.send_replace(state.running.len());
                start
            };
            admitted += 1;

            if let Some(running) = start {
                self.persist(&running).await;
                self.spawn(running);
            }
        }

        if admitted > 0 {
            tracing::info!(admitted, "Resumed unfinished jobs");
        }
        Ok(admitted)
    }

    /// Stop accepting jobs and wait up to `timeout` for running ones. Jobs
    /// still unfinished are persisted as Queued. Returns how many.
    pub async fn drain(&self, timeout: Duration) -> usize {
        {
            let mut state = self.state.lock().await;
            state.accepting = false;
        }
        tracing::info!(timeout_secs = timeout.as_secs(), "Draining job queue");

        let mut running = self.running_count.subscribe();
        if tokio::time::timeout(timeout, running.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            tracing::warn!("Running jobs did not finish before the drain timeout");
        }

        let leftover: Vec<JobRecord> = {
            let state = self.state.lock().await;
            state
                .jobs
                .values()
                .filter(|e| !e.record.status.is_terminal())
                .map(|e| {
                    let mut record = e.record.clone();
                    record.status = JobStatus::Queued;
                    record
                })
                .collect()
        };
        for record in &leftover {
            self.persist(record).await;
        }

        tracing::info!(unfinished = leftover.len(), "Job queue drained");
        leftover.len()
    }
}
