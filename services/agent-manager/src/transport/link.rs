// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Outbound half of an agent session

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;

use agent_control_types::AgentFrame;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link closed")]
    Closed,

    #[error("Invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),
}

/// Ordered, non-blocking writer to one agent
///
/// Frames sent on a link reach the agent in send order. After `close` every
/// send fails with [`LinkError::Closed`].
pub trait AgentLink: Send + Sync {
    fn send(&self, frame: AgentFrame) -> Result<(), LinkError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Item consumed by a link's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(AgentFrame),
    Close,
}

/// Link backed by an unbounded channel; the receiving end is drained by a
/// writer task (or inspected directly in tests)
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl ChannelLink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

impl AgentLink for ChannelLink {
    fn send(&self, frame: AgentFrame) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| LinkError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_arrive_in_order_then_close() {
        let (link, mut rx) = ChannelLink::new();
        link.send(AgentFrame::Ping { healthy: None }).unwrap();
        link.send(AgentFrame::Close {
            reason: "bye".to_string(),
        })
        .unwrap();
        link.close();
        link.close();

        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Frame(AgentFrame::Ping { healthy: None })
        );
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame(AgentFrame::Close { .. })));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());

        assert!(link.is_closed());
        assert!(matches!(
            link.send(AgentFrame::Ping { healthy: None }),
            Err(LinkError::Closed)
        ));
    }

    #[test]
    fn dropped_receiver_closes_link() {
        let (link, rx) = ChannelLink::new();
        drop(rx);
        assert!(link.is_closed());
        assert!(link.send(AgentFrame::Ping { healthy: None }).is_err());
    }
}
