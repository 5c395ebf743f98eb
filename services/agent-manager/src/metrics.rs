// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the agent manager
//!
//! Exports metrics for monitoring the control plane including:
//! - Commands sent, answers received and command timeouts
//! - Live agent sessions
//! - Jobs by terminal status
//! - Listener failures
//! - Agents relinquished by rebalancing

use prometheus::{Counter, CounterVec, IntGauge, Opts, Registry, TextEncoder};

// Metric constructors only fail on an invalid name or label set, which is a
// bug in this file. The allow is scoped to the definitions below.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all manager metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Command batches written to agents
        pub static ref COMMANDS_SENT: Counter = Counter::with_opts(
            Opts::new("agent_manager_commands_sent_total", "Command batches sent to agents")
        ).expect("valid metric name");

        /// Answer batches correlated to a pending request
        pub static ref ANSWERS_RECEIVED: Counter = Counter::with_opts(
            Opts::new("agent_manager_answers_received_total", "Answer batches received from agents")
        ).expect("valid metric name");

        /// Pending requests retired by their deadline
        pub static ref COMMAND_TIMEOUTS: Counter = Counter::with_opts(
            Opts::new("agent_manager_command_timeouts_total", "Pending requests that timed out")
        ).expect("valid metric name");

        /// Agent sessions currently registered on this node
        pub static ref AGENT_SESSIONS: IntGauge = IntGauge::with_opts(
            Opts::new("agent_manager_agent_sessions", "Agent sessions owned by this node")
        ).expect("valid metric name");

        /// Jobs reaching a terminal status
        pub static ref JOBS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("agent_manager_jobs_total", "Jobs completed by status"),
            &["status"]
        ).expect("valid metric name and labels");

        /// Listener callbacks that panicked
        pub static ref LISTENER_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "agent_manager_listener_failures_total",
                "Listener callbacks that failed while handling an event"
            )
        ).expect("valid metric name");

        /// Agents handed to other nodes by the rebalancer
        pub static ref AGENTS_RELINQUISHED: Counter = Counter::with_opts(
            Opts::new(
                "agent_manager_agents_relinquished_total",
                "Agents relinquished to other nodes by rebalancing"
            )
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{
    AGENT_SESSIONS, AGENTS_RELINQUISHED, ANSWERS_RECEIVED, COMMAND_TIMEOUTS, COMMANDS_SENT,
    JOBS_TOTAL, LISTENER_FAILURES, REGISTRY,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
/// Panics if registration fails (indicates a programming error).
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(COMMANDS_SENT.clone()))
        .expect("Failed to register COMMANDS_SENT");
    REGISTRY
        .register(Box::new(ANSWERS_RECEIVED.clone()))
        .expect("Failed to register ANSWERS_RECEIVED");
    REGISTRY
        .register(Box::new(COMMAND_TIMEOUTS.clone()))
        .expect("Failed to register COMMAND_TIMEOUTS");
    REGISTRY
        .register(Box::new(AGENT_SESSIONS.clone()))
        .expect("Failed to register AGENT_SESSIONS");
    REGISTRY
        .register(Box::new(JOBS_TOTAL.clone()))
        .expect("Failed to register JOBS_TOTAL");
    REGISTRY
        .register(Box::new(LISTENER_FAILURES.clone()))
        .expect("Failed to register LISTENER_FAILURES");
    REGISTRY
        .register(Box::new(AGENTS_RELINQUISHED.clone()))
        .expect("Failed to register AGENTS_RELINQUISHED");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

pub fn record_command_sent() {
    COMMANDS_SENT.inc();
}

pub fn record_answer_received() {
    ANSWERS_RECEIVED.inc();
}

pub fn record_command_timeout() {
    COMMAND_TIMEOUTS.inc();
}

pub fn set_agent_sessions(count: usize) {
    AGENT_SESSIONS.set(count as i64);
}

/// Record a job reaching a terminal status
pub fn record_job_finished(status: &str) {
    JOBS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_listener_failure() {
    LISTENER_FAILURES.inc();
}

pub fn record_agents_relinquished(count: usize) {
    AGENTS_RELINQUISHED.inc_by(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_counter_by_status() {
        let before = JOBS_TOTAL.with_label_values(&["failed"]).get();
        record_job_finished("failed");
        record_job_finished("failed");
        let after = JOBS_TOTAL.with_label_values(&["failed"]).get();

        assert_eq!(after - before, 2.0);
    }

    #[test]
    fn test_gather_contains_registered_metrics() {
        // Registration is process-wide; another test may have done it already.
        let _ = REGISTRY.register(Box::new(AGENTS_RELINQUISHED.clone()));
        record_agents_relinquished(3);

        let text = gather_metrics();
        assert!(text.contains("agent_manager_agents_relinquished_total"));
    }
}
