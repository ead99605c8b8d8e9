//! Message vocabulary and channel traits.
//!
//! # Phase Contracts
//! ```text
//! lifespan:   in  startup ........................ shutdown
//!             out      startup-complete|failed           shutdown-complete
//!
//! http:       in  body(more=true)* body(more=false)
//!             out response-start response-body(more=true)* response-body(more=false)
//!
//! websocket:  in  connect  frame* disconnect
//!             out accept   frame* close
//! ```

use bytes::Bytes;
use futures_util::future::BoxFuture;

use axum::http::StatusCode;

use crate::error::{EngineError, Result};
use crate::protocol::context::{ConnectionContext, HeaderList};

/// Stream frame payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Text => f.write_str("text"),
            FrameKind::Binary => f.write_str("binary"),
        }
    }
}

/// A single stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Text(_) => FrameKind::Text,
            Frame::Binary(_) => FrameKind::Binary,
        }
    }
}

/// Messages the transport delivers to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Startup,
    Shutdown,
    /// Request body chunk.
    Body { body: Bytes, more_body: bool },
    /// The HTTP client went away.
    HttpDisconnect,
    /// Stream handshake request.
    Connect,
    Frame(Frame),
    /// The stream peer went away.
    Disconnect { code: u16 },
}

impl InboundMessage {
    /// Wire name, used in protocol error messages.
    pub fn name(&self) -> &'static str {
        match self {
            InboundMessage::Startup => "lifespan.startup",
            InboundMessage::Shutdown => "lifespan.shutdown",
            InboundMessage::Body { .. } => "http.request",
            InboundMessage::HttpDisconnect => "http.disconnect",
            InboundMessage::Connect => "websocket.connect",
            InboundMessage::Frame(_) => "websocket.receive",
            InboundMessage::Disconnect { .. } => "websocket.disconnect",
        }
    }
}

/// Messages the engine emits to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    StartupComplete,
    StartupFailed { message: String },
    ShutdownComplete,
    ResponseStart { status: StatusCode, headers: HeaderList },
    ResponseBody { body: Bytes, more_body: bool },
    Accept { subprotocol: Option<String>, headers: HeaderList },
    Send(Frame),
    Close { code: u16, reason: String },
}

impl OutboundMessage {
    /// Wire name, used in protocol error messages.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundMessage::StartupComplete => "lifespan.startup.complete",
            OutboundMessage::StartupFailed { .. } => "lifespan.startup.failed",
            OutboundMessage::ShutdownComplete => "lifespan.shutdown.complete",
            OutboundMessage::ResponseStart { .. } => "http.response.start",
            OutboundMessage::ResponseBody { .. } => "http.response.body",
            OutboundMessage::Accept { .. } => "websocket.accept",
            OutboundMessage::Send(_) => "websocket.send",
            OutboundMessage::Close { .. } => "websocket.close",
        }
    }
}

/// Suspension point yielding the next inbound message.
pub trait Inbound: Send {
    fn receive(&mut self) -> BoxFuture<'_, Result<InboundMessage>>;
}

/// Suspension point accepting the next outbound message.
pub trait Outbound: Send {
    fn send(&mut self, message: OutboundMessage) -> BoxFuture<'_, Result<()>>;
}

/// The transport boundary: one call per connection.
///
/// Every pipeline stage, the dispatcher, and the engine itself implement
/// this, which is what lets interceptors nest.
pub trait App: Send + Sync {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Read a complete request body.
///
/// Fails with `Disconnect` if the client leaves first and with a protocol
/// error on any other message type.
pub async fn read_body(inbound: &mut dyn Inbound) -> Result<Bytes> {
    let mut first: Option<Bytes> = None;
    let mut rest: Vec<u8> = Vec::new();

    loop {
        match inbound.receive().await? {
            InboundMessage::Body { body, more_body } => {
                // Single-chunk bodies are the common case; avoid the copy.
                match first {
                    None if rest.is_empty() => first = Some(body),
                    _ => {
                        if let Some(head) = first.take() {
                            rest.extend_from_slice(&head);
                        }
                        rest.extend_from_slice(&body);
                    }
                }
                if !more_body {
                    break;
                }
            }
            InboundMessage::HttpDisconnect => {
                return Err(EngineError::Disconnect {
                    code: crate::error::ABNORMAL_CLOSURE,
                })
            }
            other => {
                return Err(EngineError::protocol(format!(
                    "unexpected {} while reading request body",
                    other.name()
                )))
            }
        }
    }

    Ok(match first {
        Some(body) => body,
        None => Bytes::from(rest),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::channel::ScriptedInbound;

    #[tokio::test]
    async fn read_body_joins_chunks() {
        let mut inbound = ScriptedInbound::new([
            InboundMessage::Body { body: Bytes::from_static(b"hello "), more_body: true },
            InboundMessage::Body { body: Bytes::from_static(b"world"), more_body: false },
        ]);
        let body = read_body(&mut inbound).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn read_body_reports_disconnect() {
        let mut inbound = ScriptedInbound::new([
            InboundMessage::Body { body: Bytes::from_static(b"part"), more_body: true },
            InboundMessage::HttpDisconnect,
        ]);
        let err = read_body(&mut inbound).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn read_body_rejects_stream_messages() {
        let mut inbound = ScriptedInbound::new([InboundMessage::Connect]);
        let err = read_body(&mut inbound).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(msg) if msg.contains("websocket.connect")));
    }
}
