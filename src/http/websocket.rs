//! Bidirectional stream connections.
//!
//! # Responsibilities
//! - Enforce the stream handshake and the CONNECTING → CONNECTED →
//!   DISCONNECTED state machine
//! - Typed frame access (text, binary, JSON) with strict type checks
//! - Idempotent close
//!
//! # Data Flow
//! ```text
//! inbound:  connect ──accept()──▶ frame* ──▶ disconnect
//!                                   │
//!                 receive_text / receive_bytes / receive_json
//!
//! outbound: accept ──▶ send_text / send_bytes / send_json ──▶ close
//! ```
//!
//! # Design Decisions
//! - A frame of the wrong type is kept pending, not dropped, so the caller
//!   can retry with the matching accessor
//! - Header and query views are built on first use

use std::sync::OnceLock;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::protocol::{
    ConnectionContext, Frame, FrameKind, HeaderList, Inbound, InboundMessage, Outbound,
    OutboundMessage, QueryParams,
};

/// Normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Policy violation; used when a connection is refused after the handshake.
pub const POLICY_VIOLATION: u16 = 1008;

/// Stream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Connecting,
    Connected,
    Disconnected,
}

/// Handle a stream handler drives.
pub struct WebSocket<'a> {
    ctx: ConnectionContext,
    inbound: &'a mut dyn Inbound,
    outbound: &'a mut dyn Outbound,
    state: WebSocketState,
    subprotocol: Option<String>,
    pending: Option<Frame>,
    remaining: Vec<String>,
    headers: OnceLock<HeaderMap>,
    query: OnceLock<QueryParams>,
}

impl<'a> WebSocket<'a> {
    /// Wrap a stream connection that has not yet been accepted.
    pub fn new(
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> Self {
        Self {
            ctx,
            inbound,
            outbound,
            state: WebSocketState::Connecting,
            subprotocol: None,
            pending: None,
            remaining: Vec::new(),
            headers: OnceLock::new(),
            query: OnceLock::new(),
        }
    }

    /// Attach the path segments below the matched route.
    pub fn with_remaining(mut self, remaining: Vec<String>) -> Self {
        self.remaining = remaining;
        self
    }

    pub fn state(&self) -> WebSocketState {
        self.state
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn path(&self) -> &str {
        &self.ctx.path
    }

    pub fn remaining(&self) -> &[String] {
        &self.remaining
    }

    /// Sub-protocol chosen at accept time.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Sub-protocols the client offered, in preference order.
    pub fn subprotocols(&self) -> Vec<&str> {
        self.ctx
            .headers
            .get_all("sec-websocket-protocol")
            .into_iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Request headers as a `HeaderMap`. Invalid pairs are skipped.
    pub fn headers(&self) -> &HeaderMap {
        self.headers.get_or_init(|| {
            let mut map = HeaderMap::with_capacity(self.ctx.headers.len());
            for (name, value) in self.ctx.headers.iter() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name),
                    HeaderValue::from_bytes(value),
                ) {
                    map.append(name, value);
                }
            }
            map
        })
    }

    pub fn query(&self) -> &QueryParams {
        self.query.get_or_init(|| self.ctx.query())
    }

    /// Complete the handshake. Only valid while CONNECTING.
    pub async fn accept(&mut self, subprotocol: Option<&str>, headers: HeaderList) -> Result<()> {
        if self.state != WebSocketState::Connecting {
            return Err(EngineError::protocol(format!(
                "cannot accept a stream in state {:?}",
                self.state
            )));
        }
        match self.inbound.receive().await? {
            InboundMessage::Connect => {}
            InboundMessage::Disconnect { code } => {
                self.state = WebSocketState::Disconnected;
                return Err(EngineError::Disconnect { code });
            }
            other => {
                return Err(EngineError::protocol(format!(
                    "expected websocket.connect, received {}",
                    other.name()
                )))
            }
        }

        self.subprotocol = subprotocol.map(str::to_string);
        self.transmit(OutboundMessage::Accept {
            subprotocol: self.subprotocol.clone(),
            headers,
        })
        .await?;
        self.state = WebSocketState::Connected;
        Ok(())
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.send_frame(Frame::Text(text.into())).await
    }

    pub async fn send_bytes(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::Binary(data.into())).await
    }

    /// Serialize `value` and send it as a text frame.
    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send_frame(Frame::Text(text)).await
    }

    pub async fn receive_text(&mut self) -> Result<String> {
        match self.next_frame().await? {
            Frame::Text(text) => Ok(text),
            other => Err(self.mismatch(FrameKind::Text, other)),
        }
    }

    pub async fn receive_bytes(&mut self) -> Result<Bytes> {
        match self.next_frame().await? {
            Frame::Binary(data) => Ok(data),
            other => Err(self.mismatch(FrameKind::Binary, other)),
        }
    }

    /// Receive a text frame and deserialize it.
    pub async fn receive_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let text = self.receive_text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Next text frame, or `None` once the peer disconnects.
    pub async fn next_text(&mut self) -> Result<Option<String>> {
        match self.receive_text().await {
            Ok(text) => Ok(Some(text)),
            Err(EngineError::Disconnect { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Close the connection. A no-op once disconnected.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        match self.state {
            WebSocketState::Disconnected => Ok(()),
            WebSocketState::Connecting => Err(EngineError::protocol(
                "cannot close a stream before it is accepted",
            )),
            WebSocketState::Connected => {
                self.state = WebSocketState::Disconnected;
                self.outbound
                    .send(OutboundMessage::Close {
                        code,
                        reason: reason.to_string(),
                    })
                    .await
            }
        }
    }

    /// Refuse the connection: accept if still connecting, then close with 1008.
    pub async fn reject(&mut self, reason: &str) -> Result<()> {
        if self.state == WebSocketState::Connecting {
            self.accept(None, HeaderList::new()).await?;
        }
        self.close(POLICY_VIOLATION, reason).await
    }

    fn ensure_connected(&self, action: &str) -> Result<()> {
        match self.state {
            WebSocketState::Connected => Ok(()),
            state => Err(EngineError::protocol(format!(
                "cannot {action} in state {state:?}"
            ))),
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.ensure_connected("send")?;
        self.transmit(OutboundMessage::Send(frame)).await
    }

    /// Send and mark the stream gone if the transport has left.
    async fn transmit(&mut self, message: OutboundMessage) -> Result<()> {
        let result = self.outbound.send(message).await;
        if matches!(result, Err(EngineError::Disconnect { .. })) {
            self.state = WebSocketState::Disconnected;
        }
        result
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        self.ensure_connected("receive")?;
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        match self.inbound.receive().await? {
            InboundMessage::Frame(frame) => Ok(frame),
            InboundMessage::Disconnect { code } => {
                self.state = WebSocketState::Disconnected;
                Err(EngineError::Disconnect { code })
            }
            other => Err(EngineError::protocol(format!(
                "unexpected {} on a connected stream",
                other.name()
            ))),
        }
    }

    fn mismatch(&mut self, expected: FrameKind, frame: Frame) -> EngineError {
        let actual = frame.kind();
        self.pending = Some(frame);
        EngineError::FrameType { expected, actual }
    }
}

impl std::fmt::Debug for WebSocket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("id", &self.ctx.id)
            .field("path", &self.ctx.path)
            .field("state", &self.state)
            .field("subprotocol", &self.subprotocol)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::channel::{RecordingOutbound, ScriptedInbound};

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut inbound = ScriptedInbound::stream([]);
        let mut outbound = RecordingOutbound::new();
        let mut ws = WebSocket::new(ConnectionContext::websocket("/ws"), &mut inbound, &mut outbound);

        ws.accept(None, HeaderList::new()).await.unwrap();
        ws.close(NORMAL_CLOSURE, "bye").await.unwrap();
        ws.close(NORMAL_CLOSURE, "bye").await.unwrap();
        assert_eq!(ws.state(), WebSocketState::Disconnected);
        drop(ws);

        assert_eq!(outbound.names(), vec!["websocket.accept", "websocket.close"]);
    }

    #[tokio::test]
    async fn close_before_accept_is_a_protocol_error() {
        let mut inbound = ScriptedInbound::stream([]);
        let mut outbound = RecordingOutbound::new();
        let mut ws = WebSocket::new(ConnectionContext::websocket("/ws"), &mut inbound, &mut outbound);
        let err = ws.close(NORMAL_CLOSURE, "").await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn receive_is_type_strict_and_keeps_the_frame() {
        let mut inbound = ScriptedInbound::stream([Frame::Binary(Bytes::from_static(b"\x01\x02"))]);
        let mut outbound = RecordingOutbound::new();
        let mut ws = WebSocket::new(ConnectionContext::websocket("/ws"), &mut inbound, &mut outbound);
        ws.accept(None, HeaderList::new()).await.unwrap();

        let err = ws.receive_text().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::FrameType { expected: FrameKind::Text, actual: FrameKind::Binary }
        ));
        let data = ws.receive_bytes().await.unwrap();
        assert_eq!(data, Bytes::from_static(b"\x01\x02"));
    }

    #[tokio::test]
    async fn disconnect_moves_to_disconnected() {
        let mut inbound = ScriptedInbound::stream([Frame::Text("hi".into())]);
        let mut outbound = RecordingOutbound::new();
        let mut ws = WebSocket::new(ConnectionContext::websocket("/ws"), &mut inbound, &mut outbound);
        ws.accept(None, HeaderList::new()).await.unwrap();

        assert_eq!(ws.next_text().await.unwrap().as_deref(), Some("hi"));
        assert_eq!(ws.next_text().await.unwrap(), None);
        assert_eq!(ws.state(), WebSocketState::Disconnected);
        assert!(matches!(ws.send_text("late").await, Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn send_requires_accept() {
        let mut inbound = ScriptedInbound::stream([]);
        let mut outbound = RecordingOutbound::new();
        let mut ws = WebSocket::new(ConnectionContext::websocket("/ws"), &mut inbound, &mut outbound);
        assert!(matches!(ws.send_text("early").await, Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn accept_records_subprotocol_and_json_round_trip() {
        let mut inbound = ScriptedInbound::stream([Frame::Text(r#"{"n":3}"#.into())]);
        let mut outbound = RecordingOutbound::new();
        let ctx = ConnectionContext::websocket("/ws")
            .with_header("Sec-WebSocket-Protocol", "chat.v2, chat.v1")
            .with_query("room=7");
        let mut ws = WebSocket::new(ctx, &mut inbound, &mut outbound);

        assert_eq!(ws.subprotocols(), vec!["chat.v2", "chat.v1"]);
        assert_eq!(ws.query().first("room"), Some("7"));
        assert!(ws.headers().contains_key("sec-websocket-protocol"));

        ws.accept(Some("chat.v2"), HeaderList::new()).await.unwrap();
        let value: serde_json::Value = ws.receive_json().await.unwrap();
        ws.send_json(&value).await.unwrap();
        assert_eq!(ws.subprotocol(), Some("chat.v2"));
        drop(ws);

        assert_eq!(
            outbound.messages[0],
            OutboundMessage::Accept { subprotocol: Some("chat.v2".into()), headers: HeaderList::new() }
        );
        assert_eq!(outbound.messages[1], OutboundMessage::Send(Frame::Text(r#"{"n":3}"#.into())));
    }

    #[tokio::test]
    async fn reject_accepts_then_closes_with_policy_violation() {
        let mut inbound = ScriptedInbound::stream([]);
        let mut outbound = RecordingOutbound::new();
        let mut ws = WebSocket::new(ConnectionContext::websocket("/ws"), &mut inbound, &mut outbound);
        ws.reject("not found").await.unwrap();
        drop(ws);
        assert_eq!(
            outbound.messages.last(),
            Some(&OutboundMessage::Close { code: POLICY_VIOLATION, reason: "not found".into() })
        );
    }
}
