//! Concrete channel implementations.
//!
//! # Responsibilities
//! - `mpsc`-backed channel pair used by the transport adapter
//! - In-memory scripted/recording channels for driving connections in tests
//!
//! # Design Decisions
//! - A closed inbound channel yields the kind-appropriate disconnect message
//!   rather than an error, so "transport went away" looks the same to the
//!   application as an explicit disconnect
//! - A closed outbound channel is reported as `Disconnect`

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use axum::http::StatusCode;

use crate::error::{EngineError, Result, ABNORMAL_CLOSURE};
use crate::protocol::context::{ConnectionKind, HeaderList};
use crate::protocol::message::{Frame, Inbound, InboundMessage, Outbound, OutboundMessage};

/// Message a closed inbound channel keeps returning.
fn closed_message(kind: ConnectionKind) -> InboundMessage {
    match kind {
        ConnectionKind::Http => InboundMessage::HttpDisconnect,
        ConnectionKind::WebSocket => InboundMessage::Disconnect { code: ABNORMAL_CLOSURE },
        ConnectionKind::Lifespan => InboundMessage::Shutdown,
    }
}

/// Application-side inbound channel fed by the transport.
#[derive(Debug)]
pub struct ChannelInbound {
    rx: mpsc::Receiver<InboundMessage>,
    kind: ConnectionKind,
}

impl Inbound for ChannelInbound {
    fn receive(&mut self) -> BoxFuture<'_, Result<InboundMessage>> {
        Box::pin(async move {
            Ok(self
                .rx
                .recv()
                .await
                .unwrap_or_else(|| closed_message(self.kind)))
        })
    }
}

/// Application-side outbound channel drained by the transport.
#[derive(Debug, Clone)]
pub struct ChannelOutbound {
    tx: mpsc::Sender<OutboundMessage>,
}

impl Outbound for ChannelOutbound {
    fn send(&mut self, message: OutboundMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.tx.send(message).await.map_err(|_| EngineError::Disconnect {
                code: ABNORMAL_CLOSURE,
            })
        })
    }
}

/// Transport side of a connection.
#[derive(Debug)]
pub struct Peer {
    pub tx: mpsc::Sender<InboundMessage>,
    pub rx: mpsc::Receiver<OutboundMessage>,
}

impl Peer {
    /// Deliver an inbound message. Returns `false` once the application is gone.
    pub async fn send(&self, message: InboundMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }

    /// Next outbound message, `None` once the application is done.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.rx.recv().await
    }
}

/// Create a bounded channel pair for one connection.
pub fn connection_channels(
    kind: ConnectionKind,
    capacity: usize,
) -> (Peer, ChannelInbound, ChannelOutbound) {
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    (
        Peer { tx: in_tx, rx: out_rx },
        ChannelInbound { rx: in_rx, kind },
        ChannelOutbound { tx: out_tx },
    )
}

/// Inbound channel replaying a fixed script.
///
/// Once the script runs out it behaves like a closed transport.
#[derive(Debug)]
pub struct ScriptedInbound {
    messages: VecDeque<InboundMessage>,
    on_empty: InboundMessage,
}

impl ScriptedInbound {
    pub fn new(messages: impl IntoIterator<Item = InboundMessage>) -> Self {
        let messages: VecDeque<_> = messages.into_iter().collect();
        let on_empty = match messages.front() {
            Some(InboundMessage::Connect) | Some(InboundMessage::Frame(_)) => {
                closed_message(ConnectionKind::WebSocket)
            }
            Some(InboundMessage::Startup) => closed_message(ConnectionKind::Lifespan),
            _ => closed_message(ConnectionKind::Http),
        };
        Self { messages, on_empty }
    }

    /// Script for an HTTP request carrying `body` in one chunk.
    pub fn request(body: impl Into<Bytes>) -> Self {
        Self::new([InboundMessage::Body {
            body: body.into(),
            more_body: false,
        }])
    }

    /// Script for a stream connection: connect, then `frames`, then disconnect.
    pub fn stream(frames: impl IntoIterator<Item = Frame>) -> Self {
        let mut messages = vec![InboundMessage::Connect];
        messages.extend(frames.into_iter().map(InboundMessage::Frame));
        messages.push(InboundMessage::Disconnect { code: 1000 });
        Self::new(messages)
    }

    /// Messages not yet consumed.
    pub fn remaining(&self) -> usize {
        self.messages.len()
    }
}

impl Inbound for ScriptedInbound {
    fn receive(&mut self) -> BoxFuture<'_, Result<InboundMessage>> {
        let next = self
            .messages
            .pop_front()
            .unwrap_or_else(|| self.on_empty.clone());
        Box::pin(async move { Ok(next) })
    }
}

/// Outbound channel that records everything sent to it.
#[derive(Debug, Default)]
pub struct RecordingOutbound {
    pub messages: Vec<OutboundMessage>,
}

/// An HTTP response reassembled from recorded messages.
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub body: Bytes,
    /// Number of `response-body` messages that carried the body.
    pub chunks: usize,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassemble the first HTTP response, if one was completely sent.
    pub fn response(&self) -> Option<RecordedResponse> {
        let mut iter = self.messages.iter();
        let (status, headers) = iter.find_map(|m| match m {
            OutboundMessage::ResponseStart { status, headers } => Some((*status, headers.clone())),
            _ => None,
        })?;

        let mut body = BytesMut::new();
        let mut chunks = 0;
        for message in iter {
            if let OutboundMessage::ResponseBody { body: chunk, more_body } = message {
                body.extend_from_slice(chunk);
                chunks += 1;
                if !more_body {
                    return Some(RecordedResponse {
                        status,
                        headers,
                        body: body.freeze(),
                        chunks,
                    });
                }
            }
        }
        None
    }

    /// Wire names of everything recorded, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.messages.iter().map(OutboundMessage::name).collect()
    }
}

impl Outbound for RecordingOutbound {
    fn send(&mut self, message: OutboundMessage) -> BoxFuture<'_, Result<()>> {
        self.messages.push(message);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_inbound_reports_disconnect() {
        let (peer, mut inbound, _outbound) = connection_channels(ConnectionKind::WebSocket, 4);
        drop(peer);
        let msg = inbound.receive().await.unwrap();
        assert_eq!(msg, InboundMessage::Disconnect { code: ABNORMAL_CLOSURE });
    }

    #[tokio::test]
    async fn closed_outbound_reports_disconnect() {
        let (peer, _inbound, mut outbound) = connection_channels(ConnectionKind::Http, 4);
        drop(peer);
        let err = outbound.send(OutboundMessage::StartupComplete).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn recording_reassembles_response() {
        let mut out = RecordingOutbound::new();
        out.send(OutboundMessage::ResponseStart {
            status: StatusCode::OK,
            headers: HeaderList::new(),
        })
        .await
        .unwrap();
        out.send(OutboundMessage::ResponseBody { body: Bytes::from_static(b"ab"), more_body: true })
            .await
            .unwrap();
        out.send(OutboundMessage::ResponseBody { body: Bytes::from_static(b"c"), more_body: false })
            .await
            .unwrap();

        let response = out.response().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"abc"));
        assert_eq!(response.chunks, 2);
    }
}
