// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Command dispatch
//!
//! Sends command batches to agents and correlates the answers that come back
//! by (agent, sequence). The dispatcher never looks inside commands or
//! answers.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use agent_control_types::{AgentId, Answer, Command, Sequence};

use crate::config::ManagerConfig;
use crate::listeners::{AnswerOutcome, AgentListener, ListenerRegistry, invoke};
use crate::metrics;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Agent {0} is unavailable")]
    AgentUnavailable(AgentId),

    #[error("Operation timed out waiting for agent {agent_id} (seq {seq})")]
    OperationTimedOut { agent_id: AgentId, seq: Sequence },

    #[error("Agent {agent_id} answered seq {seq} with {received} answers for {expected} commands")]
    MalformedAnswer {
        agent_id: AgentId,
        seq: Sequence,
        expected: usize,
        received: usize,
    },
}

/// How long `send_sync` waits for answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// The configured wait
    #[default]
    Default,
    Indefinite,
    Seconds(u64),
}

impl Wait {
    /// Map the legacy integer form: negative waits forever, 0 uses the
    /// configured default.
    pub fn from_secs(secs: i64) -> Wait {
        match secs {
            s if s < 0 => Wait::Indefinite,
            0 => Wait::Default,
            s => Wait::Seconds(s.unsigned_abs()),
        }
    }

    fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            Wait::Default => Some(default),
            Wait::Indefinite => None,
            Wait::Seconds(s) => Some(Duration::from_secs(s)),
        }
    }
}

pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    listeners: Arc<ListenerRegistry>,
    config: watch::Receiver<ManagerConfig>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        listeners: Arc<ListenerRegistry>,
        config: watch::Receiver<ManagerConfig>,
    ) -> Self {
        Self {
            registry,
            listeners,
            config,
        }
    }

    fn default_wait(&self) -> Duration {
        self.config.borrow().wait()
    }

    /// Send a batch and return its sequence without waiting. Answers are
    /// only seen by monitor listeners.
    pub async fn send_async(
        &self,
        agent_id: AgentId,
        commands: Vec<Command>,
    ) -> Result<Sequence, DispatchError> {
        let session = self
            .registry
            .session(agent_id)
            .await
            .ok_or(DispatchError::AgentUnavailable(agent_id))?;
        let deadline = Instant::now() + self.default_wait();
        let seq = session.issue(commands, None, Some(deadline), None).await?;
        tracing::debug!(agent_id, seq, "Sent async command batch");
        Ok(seq)
    }

    /// Send a batch and wait for its answers
    pub async fn send_sync(
        &self,
        agent_id: AgentId,
        commands: Vec<Command>,
        wait: Wait,
    ) -> Result<Vec<Answer>, DispatchError> {
        let session = self
            .registry
            .session(agent_id)
            .await
            .ok_or(DispatchError::AgentUnavailable(agent_id))?;

        let (tx, rx) = oneshot::channel();
        // The wait below owns the deadline; the sweeper leaves this one alone
        let seq = session.issue(commands, None, None, Some(tx)).await?;
        tracing::debug!(agent_id, seq, wait = ?wait, "Sent sync command batch");

        let result = match wait.resolve(self.default_wait()) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    session.take_pending(seq).await;
                    metrics::record_command_timeout();
                    tracing::warn!(agent_id, seq, "Sync command batch timed out");
                    return Err(DispatchError::OperationTimedOut { agent_id, seq });
                }
            },
            None => rx.await,
        };

        // A dropped sender means the session went away without answering
        result.unwrap_or(Err(DispatchError::AgentUnavailable(agent_id)))
    }

    /// Send a batch whose answers go to `listener`
    pub async fn send_async_with_listener(
        &self,
        agent_id: AgentId,
        commands: Vec<Command>,
        listener: Arc<dyn AgentListener>,
    ) -> Result<Sequence, DispatchError> {
        let session = self
            .registry
            .session(agent_id)
            .await
            .ok_or(DispatchError::AgentUnavailable(agent_id))?;
        let timeout = listener.timeout().unwrap_or_else(|| self.default_wait());
        let seq = session
            .issue(commands, Some(listener), Some(Instant::now() + timeout), None)
            .await?;
        tracing::debug!(agent_id, seq, "Sent command batch with listener");
        Ok(seq)
    }

    /// Route an answer batch to whoever is waiting on (agent, seq) in the
    /// agent's current session
    pub async fn process_answers(&self, agent_id: AgentId, seq: Sequence, answers: Vec<Answer>) {
        self.route_answers(agent_id, None, seq, answers).await;
    }

    /// Like `process_answers`, for a batch read from session `generation`.
    /// A batch from a session that has since been replaced is dropped.
    pub async fn process_session_answers(
        &self,
        agent_id: AgentId,
        generation: u64,
        seq: Sequence,
        answers: Vec<Answer>,
    ) {
        self.route_answers(agent_id, Some(generation), seq, answers)
            .await;
    }

    async fn route_answers(
        &self,
        agent_id: AgentId,
        generation: Option<u64>,
        seq: Sequence,
        answers: Vec<Answer>,
    ) {
        let Some(session) = self.registry.session(agent_id).await else {
            tracing::debug!(agent_id, seq, "Answers for an agent without a session");
            return;
        };
        if let Some(generation) = generation {
            if generation != session.generation() {
                tracing::debug!(
                    agent_id,
                    seq,
                    generation,
                    current = session.generation(),
                    "Dropping answers from a retired session"
                );
                return;
            }
        }

        match session.take_pending(seq).await {
            None => {
                tracing::debug!(agent_id, seq, "Answers for an unknown sequence");
            }
            Some(mut request) => {
                metrics::record_answer_received();

                if let Some(waiter) = request.waiter.take() {
                    let result = if answers.len() == request.command_count {
                        Ok(answers.clone())
                    } else {
                        tracing::warn!(
                            agent_id,
                            seq,
                            expected = request.command_count,
                            received = answers.len(),
                            "Malformed answer batch"
                        );
                        Err(DispatchError::MalformedAnswer {
                            agent_id,
                            seq,
                            expected: request.command_count,
                            received: answers.len(),
                        })
                    };
                    let _ = waiter.send(result);
                }

                if let Some(listener) = request.listener.clone() {
                    let outcome = invoke(listener.name(), "answers", || {
                        listener.process_answers(agent_id, seq, &answers)
                    })
                    .unwrap_or(AnswerOutcome::Done);

                    if outcome == AnswerOutcome::ExpectMore {
                        let timeout = listener.timeout().unwrap_or_else(|| self.default_wait());
                        request.deadline = Some(Instant::now() + timeout);
                        if !session.restore_pending(request).await {
                            tracing::debug!(agent_id, seq, "Session closed before more answers");
                        }
                    }
                }
            }
        }

        self.listeners.notify_answers(agent_id, seq, &answers).await;
    }

    /// Retire (agent, seq) as timed out. Returns false if nothing was pending.
    pub async fn notify_timeout(&self, agent_id: AgentId, seq: Sequence) -> bool {
        let Some(session) = self.registry.session(agent_id).await else {
            return false;
        };
        let Some(request) = session.take_pending(seq).await else {
            return false;
        };

        metrics::record_command_timeout();
        tracing::info!(
            agent_id,
            seq,
            waited_secs = request.submitted_at.elapsed().as_secs(),
            "Command batch timed out"
        );

        if let Some(listener) = request.listener {
            invoke(listener.name(), "timeout", || {
                listener.process_timeout(agent_id, seq)
            });
        }
        if let Some(waiter) = request.waiter {
            let _ = waiter.send(Err(DispatchError::OperationTimedOut { agent_id, seq }));
        }

        self.listeners.notify_timeout(agent_id, seq).await;
        true
    }

    /// Time out every request whose deadline has passed. Returns how many.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let mut swept = 0;
        for session in self.registry.sessions().await {
            for seq in session.expired(now).await {
                if self.notify_timeout(session.agent_id(), seq).await {
                    swept += 1;
                }
            }
        }
        swept
    }

    /// Run the timeout sweeper until `shutdown` flips to true
    pub fn start_timeout_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Timeout sweeper started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                let swept = self.sweep_expired(Instant::now()).await;
                if swept > 0 {
                    tracing::debug!(swept, "Swept expired command batches");
                }
            }
            tracing::info!("Timeout sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listeners::Interest;
    use crate::store::{HostStore, MemoryStore};
    use crate::transport::{AgentLink, ChannelLink, Outbound};
    use agent_control_types::{AgentFrame, AgentHello, HostType, StatusEvent};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Arc<CommandDispatcher>,
        registry: Arc<ConnectionRegistry>,
        listeners: Arc<ListenerRegistry>,
        _config_tx: watch::Sender<ManagerConfig>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn HostStore> = Arc::new(MemoryStore::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let (config_tx, config_rx) = watch::channel(ManagerConfig::default());
        let registry = Arc::new(ConnectionRegistry::new(
            1,
            store,
            Arc::clone(&listeners),
            config_rx.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&listeners),
            config_rx,
        ));
        Fixture {
            dispatcher,
            registry,
            listeners,
            _config_tx: config_tx,
        }
    }

    async fn connect(f: &Fixture, agent_id: AgentId) -> mpsc::UnboundedReceiver<Outbound> {
        let (link, rx) = ChannelLink::new();
        let link: Arc<dyn AgentLink> = Arc::new(link);
        f.registry
            .connect(
                AgentHello {
                    agent_id,
                    name: format!("kvm-{agent_id}"),
                    host_type: HostType::Routing,
                    cluster_id: Some(1),
                    sub_cluster_id: Some(1),
                    version: "1.0".to_string(),
                },
                link,
            )
            .await
            .unwrap();
        rx
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> (Sequence, Vec<Command>) {
        match rx.recv().await {
            Some(Outbound::Frame(AgentFrame::Request { seq, commands })) => (seq, commands),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    fn cmd(name: &str) -> Command {
        serde_json::json!({ "command": name })
    }

    /// Collects answers and asks for more until it has seen `want` batches
    struct Collector {
        want: usize,
        seen: Mutex<Vec<Vec<Answer>>>,
        timeouts: AtomicUsize,
    }

    impl Collector {
        fn new(want: usize) -> Self {
            Self {
                want,
                seen: Mutex::new(Vec::new()),
                timeouts: AtomicUsize::new(0),
            }
        }
    }

    impl AgentListener for Collector {
        fn process_answers(&self, _agent_id: AgentId, _seq: Sequence, answers: &[Answer]) -> AnswerOutcome {
            let mut seen = self.seen.lock().unwrap();
            seen.push(answers.to_vec());
            if seen.len() < self.want {
                AnswerOutcome::ExpectMore
            } else {
                AnswerOutcome::Done
            }
        }

        fn process_timeout(&self, _agent_id: AgentId, _seq: Sequence) -> bool {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(5))
        }
    }

    #[test]
    fn wait_from_legacy_seconds() {
        assert_eq!(Wait::from_secs(-1), Wait::Indefinite);
        assert_eq!(Wait::from_secs(0), Wait::Default);
        assert_eq!(Wait::from_secs(30), Wait::Seconds(30));
        assert_eq!(
            Wait::Default.resolve(Duration::from_secs(1800)),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(Wait::Indefinite.resolve(Duration::from_secs(1800)), None);
    }

    #[tokio::test]
    async fn sequences_increase_per_session() {
        let f = fixture();
        let _rx = connect(&f, 1).await;

        let mut last = 0;
        for _ in 0..20 {
            let seq = f.dispatcher.send_async(1, vec![cmd("Ping")]).await.unwrap();
            assert!(seq > last);
            last = seq;
        }
    }

    #[tokio::test]
    async fn concurrent_sends_never_share_a_sequence() {
        let f = fixture();
        let _rx = connect(&f, 1).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let dispatcher = Arc::clone(&f.dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher.send_async(1, vec![cmd("Ping")]).await.unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 32);
    }

    #[tokio::test]
    async fn send_to_unknown_agent_is_unavailable() {
        let f = fixture();
        assert_eq!(
            f.dispatcher.send_async(99, vec![cmd("Ping")]).await,
            Err(DispatchError::AgentUnavailable(99))
        );
    }

    #[tokio::test]
    async fn send_sync_returns_answers() {
        let f = fixture();
        let mut rx = connect(&f, 2).await;

        let agent = {
            let dispatcher = Arc::clone(&f.dispatcher);
            tokio::spawn(async move {
                let (seq, commands) = next_request(&mut rx).await;
                let answers = commands
                    .iter()
                    .map(|_| Answer::Success(serde_json::json!("ok")))
                    .collect();
                dispatcher.process_answers(2, seq, answers).await;
            })
        };

        let answers = f
            .dispatcher
            .send_sync(2, vec![cmd("StartVm"), cmd("StopVm")], Wait::Seconds(5))
            .await
            .unwrap();
        assert_eq!(answers.len(), 2);
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn send_sync_rejects_short_answer_batch() {
        let f = fixture();
        let mut rx = connect(&f, 2).await;

        let dispatcher = Arc::clone(&f.dispatcher);
        tokio::spawn(async move {
            let (seq, _) = next_request(&mut rx).await;
            dispatcher
                .process_answers(2, seq, vec![Answer::Failure("boom".to_string())])
                .await;
        });

        let err = f
            .dispatcher
            .send_sync(2, vec![cmd("A"), cmd("B")], Wait::Seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::MalformedAnswer {
                expected: 2,
                received: 1,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_sync_times_out_and_retires_request() {
        let f = fixture();
        let _rx = connect(&f, 3).await;

        let err = f
            .dispatcher
            .send_sync(3, vec![cmd("Slow")], Wait::Seconds(2))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::OperationTimedOut { agent_id: 3, seq: 1 });

        let session = f.registry.session(3).await.unwrap();
        assert_eq!(session.pending_count().await, 0);
    }

    #[tokio::test]
    async fn reconnect_fails_outstanding_sync_send() {
        let f = fixture();
        let mut rx = connect(&f, 4).await;

        let dispatcher = Arc::clone(&f.dispatcher);
        let waiter = tokio::spawn(async move {
            dispatcher
                .send_sync(4, vec![cmd("Migrate")], Wait::Indefinite)
                .await
        });
        let (seq, _) = next_request(&mut rx).await;
        assert_eq!(seq, 1);

        // Fresh session, fresh sequence space
        let mut rx2 = connect(&f, 4).await;
        assert_eq!(waiter.await.unwrap(), Err(DispatchError::AgentUnavailable(4)));

        f.dispatcher.send_async(4, vec![cmd("Ping")]).await.unwrap();
        let (seq, _) = next_request(&mut rx2).await;
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn answers_from_retired_session_are_dropped() {
        let f = fixture();
        let _old_rx = connect(&f, 4).await;
        let old_generation = f.registry.session(4).await.unwrap().generation();
        let mut rx = connect(&f, 4).await;
        let generation = f.registry.session(4).await.unwrap().generation();
        assert_ne!(old_generation, generation);

        let dispatcher = Arc::clone(&f.dispatcher);
        let waiter = tokio::spawn(async move {
            dispatcher
                .send_sync(4, vec![cmd("Status")], Wait::Seconds(5))
                .await
        });
        let (seq, _) = next_request(&mut rx).await;

        // Same agent and sequence, but read from the replaced connection
        f.dispatcher
            .process_session_answers(
                4,
                old_generation,
                seq,
                vec![Answer::Success(serde_json::json!("OLD-SESSION"))],
            )
            .await;
        assert_eq!(f.registry.session(4).await.unwrap().pending_count().await, 1);

        f.dispatcher
            .process_session_answers(
                4,
                generation,
                seq,
                vec![Answer::Success(serde_json::json!("current"))],
            )
            .await;
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            vec![Answer::Success(serde_json::json!("current"))]
        );
    }

    #[tokio::test]
    async fn recurring_listener_keeps_request_alive() {
        let f = fixture();
        let _rx = connect(&f, 5).await;
        let collector = Arc::new(Collector::new(3));

        let seq = f
            .dispatcher
            .send_async_with_listener(5, vec![cmd("Watch")], collector.clone())
            .await
            .unwrap();
        let session = f.registry.session(5).await.unwrap();

        for n in 0..3 {
            assert_eq!(session.pending_count().await, 1);
            f.dispatcher
                .process_answers(5, seq, vec![Answer::Success(serde_json::json!(n))])
                .await;
        }
        assert_eq!(session.pending_count().await, 0);
        assert_eq!(collector.seen.lock().unwrap().len(), 3);

        // Late answers for a retired sequence are dropped
        f.dispatcher
            .process_answers(5, seq, vec![Answer::Success(serde_json::json!(9))])
            .await;
        assert_eq!(collector.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_times_out_listener_requests() {
        let f = fixture();
        let _rx = connect(&f, 6).await;
        let collector = Arc::new(Collector::new(1));
        let monitor = Arc::new(Collector::new(1));
        f.listeners
            .register(monitor.clone(), Interest::COMMANDS, 0)
            .await;

        f.dispatcher
            .send_async_with_listener(6, vec![cmd("Watch")], collector.clone())
            .await
            .unwrap();

        assert_eq!(f.dispatcher.sweep_expired(Instant::now()).await, 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(f.dispatcher.sweep_expired(Instant::now()).await, 1);

        assert_eq!(collector.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.timeouts.load(Ordering::SeqCst), 1);
        assert!(!f.dispatcher.notify_timeout(6, 1).await);
    }

    #[tokio::test]
    async fn monitors_see_answers() {
        let f = fixture();
        let _rx = connect(&f, 7).await;
        let monitor = Arc::new(Collector::new(1));
        f.listeners
            .register(monitor.clone(), Interest::COMMANDS, 0)
            .await;

        let seq = f.dispatcher.send_async(7, vec![cmd("Ping")]).await.unwrap();
        f.dispatcher
            .process_answers(7, seq, vec![Answer::Success(serde_json::Value::Null)])
            .await;
        assert_eq!(monitor.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnected_agent_is_unavailable() {
        let f = fixture();
        let _rx = connect(&f, 8).await;
        f.registry.disconnect(8, StatusEvent::AgentDisconnected).await;

        assert_eq!(
            f.dispatcher.send_async(8, vec![cmd("Ping")]).await,
            Err(DispatchError::AgentUnavailable(8))
        );
    }
}
