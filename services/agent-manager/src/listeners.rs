// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Listener registry
//!
//! Components interested in agent lifecycle events implement
//! [`AgentListener`] and register with a [`ListenerRegistry`]. Every event is
//! fanned out to all listeners whose interest matches, highest priority
//! first, ties in registration order. The registry lock is released before
//! any listener runs, and a panicking listener is logged and skipped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;

use agent_control_types::{AgentHello, AgentId, Answer, Command, Sequence, Status};

use crate::metrics;

/// Raised by a connect listener to refuse a handshake
#[derive(Debug, Clone, Error)]
#[error("Connection rejected: {0}")]
pub struct ConnectionError(pub String);

/// What a listener wants done with a pending request after seeing answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Retire the pending request
    Done,
    /// Keep it alive for further answers under the same sequence
    ExpectMore,
}

/// Which event kinds a listener receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Connect, disconnect and control commands
    pub connections: bool,
    /// Inbound commands, answers and timeouts
    pub commands: bool,
}

impl Interest {
    pub const ALL: Interest = Interest {
        connections: true,
        commands: true,
    };
    pub const CONNECTIONS: Interest = Interest {
        connections: true,
        commands: false,
    };
    pub const COMMANDS: Interest = Interest {
        connections: false,
        commands: true,
    };
}

/// Receiver of agent lifecycle events
///
/// Every hook has a default that ignores the event. Hooks run on the event
/// path and must return promptly.
pub trait AgentListener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "listener"
    }

    /// An agent completed its handshake. Returning an error refuses it.
    fn process_connect(&self, _hello: &AgentHello, _reconnect: bool) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// A session ended; `status` is the liveness it ended in.
    /// Returns whether the listener handled the event.
    fn process_disconnect(&self, _agent_id: AgentId, _status: Status) -> bool {
        false
    }

    /// The agent sent a command batch. `Some` answers it, one answer per
    /// command.
    fn process_commands(
        &self,
        _agent_id: AgentId,
        _seq: Sequence,
        _commands: &[Command],
    ) -> Option<Vec<Answer>> {
        None
    }

    /// The agent sent a ping.
    fn process_control_command(&self, _agent_id: AgentId, _healthy: Option<bool>) -> bool {
        false
    }

    /// Answers arrived for a sequence this listener is attached to, or that
    /// it monitors.
    fn process_answers(&self, _agent_id: AgentId, _seq: Sequence, _answers: &[Answer]) -> AnswerOutcome {
        AnswerOutcome::Done
    }

    /// The pending request for `seq` passed its deadline.
    fn process_timeout(&self, _agent_id: AgentId, _seq: Sequence) -> bool {
        false
    }

    /// Deadline for requests this listener is attached to; `None` uses the
    /// dispatcher default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Handle returned by [`ListenerRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct Registration {
    handle: ListenerHandle,
    interest: Interest,
    priority: i32,
    listener: Arc<dyn AgentListener>,
}

/// Run one listener callback, isolating panics
pub(crate) fn invoke<T>(name: &str, event: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Some(v),
        Err(_) => {
            metrics::record_listener_failure();
            tracing::error!(listener = %name, event = %event, "Listener panicked");
            None
        }
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    entries: RwLock<Vec<Registration>>,
    next_handle: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        listener: Arc<dyn AgentListener>,
        interest: Interest,
        priority: i32,
    ) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            listener = %listener.name(),
            priority,
            connections = interest.connections,
            commands = interest.commands,
            "Registering listener"
        );

        let mut entries = self.entries.write().await;
        // Insert after every entry of equal or higher priority
        let pos = entries
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(entries.len());
        entries.insert(
            pos,
            Registration {
                handle,
                interest,
                priority,
                listener,
            },
        );
        handle
    }

    /// Returns false if the handle was not registered
    pub async fn unregister(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|r| r.handle != handle);
        entries.len() != before
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Matching listeners in fan-out order. The lock is released on return.
    async fn snapshot(&self, want: impl Fn(Interest) -> bool) -> Vec<Arc<dyn AgentListener>> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|r| want(r.interest))
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }

    /// Fan out a connect. Stops at the first rejection.
    pub async fn notify_connect(
        &self,
        hello: &AgentHello,
        reconnect: bool,
    ) -> Result<(), ConnectionError> {
        for listener in self.snapshot(|i| i.connections).await {
            if let Some(Err(e)) = invoke(listener.name(), "connect", || {
                listener.process_connect(hello, reconnect)
            }) {
                tracing::info!(
                    agent_id = hello.agent_id,
                    listener = %listener.name(),
                    reason = %e,
                    "Connect rejected by listener"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn notify_disconnect(&self, agent_id: AgentId, status: Status) {
        for listener in self.snapshot(|i| i.connections).await {
            invoke(listener.name(), "disconnect", || {
                listener.process_disconnect(agent_id, status)
            });
        }
    }

    /// Fan out an inbound command batch. The first listener to answer
    /// supplies the reply; later listeners still see the batch.
    pub async fn notify_commands(
        &self,
        agent_id: AgentId,
        seq: Sequence,
        commands: &[Command],
    ) -> Option<Vec<Answer>> {
        let mut reply = None;
        for listener in self.snapshot(|i| i.commands).await {
            let answers = invoke(listener.name(), "commands", || {
                listener.process_commands(agent_id, seq, commands)
            })
            .flatten();
            if reply.is_none() {
                reply = answers;
            }
        }
        reply
    }

    pub async fn notify_control_command(&self, agent_id: AgentId, healthy: Option<bool>) {
        for listener in self.snapshot(|i| i.connections).await {
            invoke(listener.name(), "control_command", || {
                listener.process_control_command(agent_id, healthy)
            });
        }
    }

    /// Monitors see every answer batch; their outcome does not affect the
    /// pending request.
    pub async fn notify_answers(&self, agent_id: AgentId, seq: Sequence, answers: &[Answer]) {
        for listener in self.snapshot(|i| i.commands).await {
            invoke(listener.name(), "answers", || {
                listener.process_answers(agent_id, seq, answers)
            });
        }
    }

    pub async fn notify_timeout(&self, agent_id: AgentId, seq: Sequence) {
        for listener in self.snapshot(|i| i.commands).await {
            invoke(listener.name(), "timeout", || {
                listener.process_timeout(agent_id, seq)
            });
        }
    }
}
