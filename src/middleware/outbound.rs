//! Outbound channel wrappers shared by interceptors.
//!
//! # Responsibilities
//! - `HeaderTap`: rewrite the `response-start` status and headers, forward
//!   everything else
//! - `BufferingOutbound`: hold a complete response so a stage can rewrite
//!   the body before anything reaches the transport

use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;

use crate::error::{EngineError, Result};
use crate::protocol::{HeaderList, Outbound, OutboundMessage};

/// Forwards every message, letting a closure edit the response start.
pub struct HeaderTap<'a, F> {
    inner: &'a mut dyn Outbound,
    edit: F,
}

impl<'a, F> HeaderTap<'a, F>
where
    F: FnMut(&mut StatusCode, &mut HeaderList) + Send,
{
    pub fn new(inner: &'a mut dyn Outbound, edit: F) -> Self {
        Self { inner, edit }
    }
}

impl<F> Outbound for HeaderTap<'_, F>
where
    F: FnMut(&mut StatusCode, &mut HeaderList) + Send,
{
    fn send(&mut self, message: OutboundMessage) -> BoxFuture<'_, Result<()>> {
        let message = match message {
            OutboundMessage::ResponseStart {
                mut status,
                mut headers,
            } => {
                (self.edit)(&mut status, &mut headers);
                OutboundMessage::ResponseStart { status, headers }
            }
            other => other,
        };
        self.inner.send(message)
    }
}

/// A complete response held by a buffering stage.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl BufferedResponse {
    /// Replace the body and keep `content-length` in step with it.
    pub fn set_body(&mut self, body: Bytes) {
        self.headers.set("content-length", body.len().to_string());
        self.body = body;
    }

    /// Emit as a start message and a single final body chunk.
    pub async fn send(self, outbound: &mut dyn Outbound) -> Result<()> {
        outbound
            .send(OutboundMessage::ResponseStart {
                status: self.status,
                headers: self.headers,
            })
            .await?;
        outbound
            .send(OutboundMessage::ResponseBody {
                body: self.body,
                more_body: false,
            })
            .await
    }
}

enum BufferState {
    /// No `response-start` yet.
    Waiting,
    /// The response was not selected; messages go straight through.
    PassThrough,
    Capturing {
        status: StatusCode,
        headers: HeaderList,
        body: BytesMut,
    },
    Complete(BufferedResponse),
}

/// Captures responses the selector accepts; forwards the rest untouched.
///
/// A captured stream comes out buffered: the completed response always
/// carries a `content-length` matching the accumulated body.
pub struct BufferingOutbound<'a, F> {
    inner: &'a mut dyn Outbound,
    select: F,
    state: BufferState,
}

impl<'a, F> BufferingOutbound<'a, F>
where
    F: Fn(StatusCode, &HeaderList) -> bool + Send,
{
    /// `select` sees the status and headers and decides whether to hold the body.
    pub fn new(inner: &'a mut dyn Outbound, select: F) -> Self {
        Self {
            inner,
            select,
            state: BufferState::Waiting,
        }
    }

    /// Take the captured response, if one was selected and completed.
    ///
    /// A selected response whose final chunk never arrived is a protocol error.
    pub fn take(&mut self) -> Result<Option<BufferedResponse>> {
        match std::mem::replace(&mut self.state, BufferState::PassThrough) {
            BufferState::Complete(response) => Ok(Some(response)),
            BufferState::Capturing { .. } => Err(EngineError::protocol(
                "response ended without a final body chunk",
            )),
            BufferState::Waiting | BufferState::PassThrough => Ok(None),
        }
    }

    /// The wrapped channel, for sending the rewritten response.
    pub fn inner(&mut self) -> &mut dyn Outbound {
        &mut *self.inner
    }
}

impl<F> Outbound for BufferingOutbound<'_, F>
where
    F: Fn(StatusCode, &HeaderList) -> bool + Send,
{
    fn send(&mut self, message: OutboundMessage) -> BoxFuture<'_, Result<()>> {
        let state = std::mem::replace(&mut self.state, BufferState::PassThrough);
        let (next, forward) = match (state, message) {
            (BufferState::Waiting, OutboundMessage::ResponseStart { status, headers }) => {
                if (self.select)(status, &headers) {
                    let body = BytesMut::new();
                    (BufferState::Capturing { status, headers, body }, None)
                } else {
                    (
                        BufferState::PassThrough,
                        Some(OutboundMessage::ResponseStart { status, headers }),
                    )
                }
            }
            (
                BufferState::Capturing {
                    status,
                    headers,
                    mut body,
                },
                OutboundMessage::ResponseBody {
                    body: chunk,
                    more_body,
                },
            ) => {
                body.extend_from_slice(&chunk);
                if more_body {
                    (BufferState::Capturing { status, headers, body }, None)
                } else {
                    let mut response = BufferedResponse {
                        status,
                        headers,
                        body: Bytes::new(),
                    };
                    response.set_body(body.freeze());
                    (BufferState::Complete(response), None)
                }
            }
            (BufferState::PassThrough, message) => (BufferState::PassThrough, Some(message)),
            (state, message) => {
                let name = message.name();
                self.state = state;
                return Box::pin(async move {
                    Err(EngineError::protocol(format!(
                        "unexpected {name} while buffering a response"
                    )))
                });
            }
        };

        self.state = next;
        match forward {
            Some(message) => self.inner.send(message),
            None => Box::pin(async { Ok(()) }),
        }
    }
}
