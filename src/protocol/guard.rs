//! Outbound phase enforcement for request/response connections.

use futures_util::future::BoxFuture;

use axum::http::StatusCode;

use crate::error::{EngineError, Result};
use crate::protocol::message::{Outbound, OutboundMessage};

/// Where a response currently is in its phase contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePhase {
    /// Nothing sent yet.
    Pending,
    /// `response-start` sent, body still open.
    Streaming,
    /// Final body chunk sent.
    Complete,
}

/// Outbound wrapper that rejects out-of-phase HTTP messages.
///
/// Start must come first and only once; body chunks only after it; nothing
/// after the chunk with `more_body=false`.
pub struct ResponseGuard<'a> {
    inner: &'a mut dyn Outbound,
    phase: ResponsePhase,
    status: Option<StatusCode>,
    bytes_sent: u64,
}

impl<'a> ResponseGuard<'a> {
    pub fn new(inner: &'a mut dyn Outbound) -> Self {
        Self {
            inner,
            phase: ResponsePhase::Pending,
            status: None,
            bytes_sent: 0,
        }
    }

    pub fn phase(&self) -> ResponsePhase {
        self.phase
    }

    /// True once `response-start` went out; the status can no longer change.
    pub fn started(&self) -> bool {
        self.phase != ResponsePhase::Pending
    }

    pub fn is_complete(&self) -> bool {
        self.phase == ResponsePhase::Complete
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Body bytes forwarded so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn advance(&mut self, message: &OutboundMessage) -> Result<()> {
        self.phase = match (self.phase, message) {
            (ResponsePhase::Pending, OutboundMessage::ResponseStart { status, .. }) => {
                self.status = Some(*status);
                ResponsePhase::Streaming
            }
            (ResponsePhase::Streaming, OutboundMessage::ResponseBody { body, more_body }) => {
                self.bytes_sent += body.len() as u64;
                if *more_body {
                    ResponsePhase::Streaming
                } else {
                    ResponsePhase::Complete
                }
            }
            (phase, message) => {
                return Err(EngineError::protocol(format!(
                    "unexpected {} in response phase {:?}",
                    message.name(),
                    phase
                )))
            }
        };
        Ok(())
    }
}

impl Outbound for ResponseGuard<'_> {
    fn send(&mut self, message: OutboundMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.advance(&message)?;
            self.inner.send(message).await
        })
    }
}
