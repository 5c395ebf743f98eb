// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent session transport
//!
//! Agents connect over TCP and exchange newline-delimited JSON
//! [`AgentFrame`]s. The first frame of a connection must be `Hello`. After
//! the handshake the agent is sent its management-server list, then a writer
//! task drains the session's link in order while the reader routes inbound
//! frames:
//!
//! - `Response` to the dispatcher
//! - `Request` to command listeners, replying with one answer per command
//! - `Ping` to the registry
//! - `Close` ends the session as an agent shutdown

mod link;

pub use link::{AgentLink, ChannelLink, LinkError, Outbound};

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

use agent_control_types::{AgentFrame, AgentId, Answer, StatusEvent};

use crate::context::ManagerContext;

/// Longest accepted frame (bytes)
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Accept agent connections until the context shuts down
pub async fn serve(listener: TcpListener, ctx: Arc<ManagerContext>) {
    let mut shutdown = ctx.shutdown_signal();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx).await {
                                tracing::warn!(peer = %peer, error = %e, "Agent connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Agent listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ManagerContext>,
) -> Result<(), LinkError> {
    tracing::debug!(peer = %peer, "New agent connection");

    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let (mut sink, mut lines) = framed.split();

    let hello = match lines.next().await {
        None => return Ok(()),
        Some(line) => match serde_json::from_str::<AgentFrame>(&line?)? {
            AgentFrame::Hello(hello) => hello,
            other => {
                tracing::warn!(peer = %peer, frame = ?other, "First frame was not a hello");
                let close = AgentFrame::Close {
                    reason: "expected hello".to_string(),
                };
                sink.send(serde_json::to_string(&close)?).await?;
                return Ok(());
            }
        },
    };
    let agent_id = hello.agent_id;

    let (link, mut outbound) = ChannelLink::new();
    let link = Arc::new(link);
    let info = match ctx.registry.connect(hello, link.clone()).await {
        Ok(info) => info,
        Err(e) => {
            tracing::info!(peer = %peer, agent_id, error = %e, "Handshake refused");
            let close = AgentFrame::Close {
                reason: e.to_string(),
            };
            sink.send(serde_json::to_string(&close)?).await?;
            return Ok(());
        }
    };

    if let Some(session) = ctx
        .registry
        .session(agent_id)
        .await
        .filter(|s| s.generation() == info.generation)
    {
        if let Err(e) = ctx.lb.publish(&session).await {
            tracing::warn!(agent_id, error = %e, "Failed to compute management server list");
        }
    }

    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(frame) => sink.send(serde_json::to_string(&frame)?).await?,
                Outbound::Close => break,
            }
        }
        sink.close().await?;
        Ok::<(), LinkError>(())
    });

    let mut writer_result = None;
    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        tracing::warn!(agent_id, error = %e, "Failed to read frame");
                        break;
                    }
                };
                if !route(&ctx, agent_id, info.generation, link.as_ref(), &line).await {
                    break;
                }
            }
            result = &mut writer => {
                writer_result = Some(result);
                break;
            }
        }
    }

    ctx.registry
        .disconnect_session(agent_id, info.generation, StatusEvent::AgentDisconnected)
        .await;
    link.close();

    let result = match writer_result {
        Some(result) => result,
        None => writer.await,
    };
    result.map_err(|e| LinkError::Io(std::io::Error::other(e)))?
}

/// Handle one inbound frame. Returns false when the session should end.
async fn route(
    ctx: &ManagerContext,
    agent_id: AgentId,
    generation: u64,
    link: &dyn AgentLink,
    line: &str,
) -> bool {
    let frame = match serde_json::from_str::<AgentFrame>(line) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(agent_id, error = %e, "Malformed frame");
            return true;
        }
    };

    match frame {
        AgentFrame::Response { seq, answers } => {
            ctx.dispatcher
                .process_session_answers(agent_id, generation, seq, answers)
                .await;
        }
        AgentFrame::Request { seq, commands } => {
            let answers = ctx
                .listeners
                .notify_commands(agent_id, seq, &commands)
                .await
                .unwrap_or_else(|| {
                    commands
                        .iter()
                        .map(|_| Answer::Unsupported("no handler for command".to_string()))
                        .collect()
                });
            if link.send(AgentFrame::Response { seq, answers }).is_err() {
                return false;
            }
        }
        AgentFrame::Ping { healthy } => {
            if let Err(e) = ctx
                .registry
                .record_session_ping(agent_id, generation, healthy)
                .await
            {
                tracing::debug!(agent_id, error = %e, "Ping not recorded");
            }
        }
        AgentFrame::Close { reason } => {
            tracing::info!(agent_id, reason = %reason, "Agent requested shutdown");
            ctx.registry
                .disconnect_session(agent_id, generation, StatusEvent::ShutdownRequested)
                .await;
            return false;
        }
        other => {
            tracing::debug!(agent_id, frame = ?other, "Ignoring unexpected frame");
        }
    }
    !link.is_closed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::dispatcher::Wait;
    use crate::store::MemoryStore;
    use agent_control_types::{AgentHello, HostType};
    use serde_json::json;
    use tokio::sync::{mpsc, watch};

    fn context() -> (Arc<ManagerContext>, watch::Sender<ManagerConfig>) {
        let (tx, rx) = watch::channel(ManagerConfig {
            node_id: 1,
            node_address: "10.0.0.1".to_string(),
            management_servers: vec!["10.0.0.1".to_string()],
            ..Default::default()
        });
        (Arc::new(ManagerContext::new(rx, Arc::new(MemoryStore::new()))), tx)
    }

    async fn connect(
        ctx: &ManagerContext,
        agent_id: AgentId,
    ) -> (Arc<ChannelLink>, u64, mpsc::UnboundedReceiver<Outbound>) {
        let (link, rx) = ChannelLink::new();
        let link = Arc::new(link);
        let info = ctx
            .registry
            .connect(
                AgentHello {
                    agent_id,
                    name: format!("kvm-{agent_id}"),
                    host_type: HostType::Routing,
                    cluster_id: Some(1),
                    sub_cluster_id: Some(1),
                    version: "1.0".to_string(),
                },
                link.clone(),
            )
            .await
            .unwrap();
        (link, info.generation, rx)
    }

    async fn next_request_seq(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> u64 {
        loop {
            match rx.recv().await {
                Some(Outbound::Frame(AgentFrame::Request { seq, .. })) => return seq,
                Some(Outbound::Frame(_)) => continue,
                other => panic!("expected a request, got {other:?}"),
            }
        }
    }

    fn response(seq: u64, value: &str) -> String {
        serde_json::to_string(&AgentFrame::Response {
            seq,
            answers: vec![Answer::Success(json!(value))],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn stale_connection_cannot_answer_for_new_session() {
        let (ctx, _config) = context();
        let (old_link, old_generation, _old_rx) = connect(&ctx, 4).await;
        let (link, generation, mut rx) = connect(&ctx, 4).await;

        let dispatcher = Arc::clone(&ctx.dispatcher);
        let waiter = tokio::spawn(async move {
            dispatcher
                .send_sync(4, vec![json!({ "command": "Status" })], Wait::Seconds(5))
                .await
        });
        let seq = next_request_seq(&mut rx).await;
        assert_eq!(seq, 1);

        // The old connection's reader is still draining buffered frames
        let stale = response(seq, "OLD-SESSION");
        route(&ctx, 4, old_generation, old_link.as_ref(), &stale).await;
        let session = ctx.registry.session(4).await.unwrap();
        assert_eq!(session.pending_count().await, 1);

        route(&ctx, 4, generation, link.as_ref(), &response(seq, "current")).await;
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            vec![Answer::Success(json!("current"))]
        );
    }
}
