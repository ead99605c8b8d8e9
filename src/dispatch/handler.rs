//! Handler contracts.
//!
//! A handler is what a route node points at. HTTP handlers receive an owned
//! [`Request`] and return a [`HandlerOutput`]; stream handlers drive a
//! [`WebSocket`] until it closes.

use std::future::Future;
use std::marker::PhantomData;
use std::path::PathBuf;

use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::error::Result;
use crate::http::response::{BodyStream, Response};
use crate::http::websocket::WebSocket;
use crate::http::Request;
use crate::routing::RouteMetadata;

/// What a handler may return.
pub enum HandlerOutput {
    /// 204-style empty body (status from metadata, default 200).
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
    /// Lazily produced body of unknown length.
    Stream(BodyStream),
    /// File read in bounded chunks.
    File(PathBuf),
    Redirect { location: String, status: StatusCode },
    /// Fully built response, sent as-is.
    Response(Response),
    /// Output plus metadata that overrides the route's metadata.
    Wrapped {
        output: Box<HandlerOutput>,
        metadata: RouteMetadata,
    },
}

impl HandlerOutput {
    /// Serialize a value as the JSON output.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(HandlerOutput::Json(serde_json::to_value(value)?))
    }

    /// Attach metadata that wins over the route node's on conflict.
    pub fn wrapped(self, metadata: RouteMetadata) -> Self {
        HandlerOutput::Wrapped {
            output: Box::new(self),
            metadata,
        }
    }

    /// Strip any wrapping, merging wrapped metadata over `base`.
    ///
    /// Nested wrappers merge outermost-last, so the outermost wins.
    pub fn unwrap_metadata(self, base: &RouteMetadata) -> (HandlerOutput, RouteMetadata) {
        match self {
            HandlerOutput::Wrapped { output, metadata } => {
                let (inner, merged) = output.unwrap_metadata(base);
                (inner, merged.merge(&metadata))
            }
            other => (other, base.clone()),
        }
    }
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerOutput::Empty => f.write_str("Empty"),
            HandlerOutput::Text(t) => f.debug_tuple("Text").field(t).finish(),
            HandlerOutput::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            HandlerOutput::Json(v) => f.debug_tuple("Json").field(v).finish(),
            HandlerOutput::Stream(_) => f.write_str("Stream"),
            HandlerOutput::File(p) => f.debug_tuple("File").field(p).finish(),
            HandlerOutput::Redirect { location, status } => f
                .debug_struct("Redirect")
                .field("location", location)
                .field("status", status)
                .finish(),
            HandlerOutput::Response(r) => f.debug_tuple("Response").field(&r.status()).finish(),
            HandlerOutput::Wrapped { output, metadata } => f
                .debug_struct("Wrapped")
                .field("output", output)
                .field("metadata", metadata)
                .finish(),
        }
    }
}

impl From<String> for HandlerOutput {
    fn from(value: String) -> Self {
        HandlerOutput::Text(value)
    }
}

impl From<&'static str> for HandlerOutput {
    fn from(value: &'static str) -> Self {
        HandlerOutput::Text(value.to_string())
    }
}

impl From<Bytes> for HandlerOutput {
    fn from(value: Bytes) -> Self {
        HandlerOutput::Bytes(value)
    }
}

impl From<serde_json::Value> for HandlerOutput {
    fn from(value: serde_json::Value) -> Self {
        HandlerOutput::Json(value)
    }
}

impl From<Response> for HandlerOutput {
    fn from(value: Response) -> Self {
        HandlerOutput::Response(value)
    }
}

/// Request/response handler.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request) -> BoxFuture<'static, Result<HandlerOutput>>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput>> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<'static, Result<HandlerOutput>> {
        Box::pin((self.f)(request))
    }
}

/// Build a handler from `async |request| -> Result<HandlerOutput>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput>> + Send + 'static,
{
    FnHandler {
        f,
        _phantom: PhantomData,
    }
}

/// Bidirectional stream handler.
///
/// The socket borrows the connection's channels, so the future is tied to
/// its lifetime.
pub trait StreamHandler: Send + Sync + 'static {
    fn call<'a>(&'a self, socket: WebSocket<'a>) -> BoxFuture<'a, Result<()>>;
}

/// Adapter turning a closure into a [`StreamHandler`].
pub struct FnStreamHandler<F> {
    f: F,
}

impl<F> StreamHandler for FnStreamHandler<F>
where
    F: for<'a> Fn(WebSocket<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, socket: WebSocket<'a>) -> BoxFuture<'a, Result<()>> {
        (self.f)(socket)
    }
}

/// Build a stream handler from `|socket| Box::pin(async move { ... })`.
pub fn stream_handler_fn<F>(f: F) -> FnStreamHandler<F>
where
    F: for<'a> Fn(WebSocket<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    FnStreamHandler { f }
}
