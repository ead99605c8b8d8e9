//! Request view handed to HTTP handlers.
//!
//! # Responsibilities
//! - Bundle the connection context, the fully read body, the parsed query
//!   and the path remainder below the matched route
//! - Expose the tracked request so handlers can queue response headers and
//!   cookies
//!
//! # Design Decisions
//! - The body is read before the handler runs, so a handler owns its
//!   request outright and can be an ordinary closure
//! - The request ID header name is shared with the `request_id` interceptor

use std::sync::Arc;

use axum::http::Method;
use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::dispatch::registry::{RequestId, TrackedRequest};
use crate::error::{EngineError, Result};
use crate::http::cookie::SetCookie;
use crate::protocol::{ConnectionContext, QueryParams};

/// Header carrying the request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Correlation ID assigned by the `request_id` interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

/// An HTTP request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    ctx: ConnectionContext,
    body: Bytes,
    query: QueryParams,
    remaining: Vec<String>,
    tracked: Arc<TrackedRequest>,
}

impl Request {
    pub fn new(
        ctx: ConnectionContext,
        body: Bytes,
        query: QueryParams,
        remaining: Vec<String>,
        tracked: Arc<TrackedRequest>,
    ) -> Self {
        Self {
            ctx,
            body,
            query,
            remaining,
            tracked,
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn method(&self) -> &Method {
        &self.ctx.method
    }

    pub fn path(&self) -> &str {
        &self.ctx.path
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.ctx.header(name)
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    /// Path segments below the matched route.
    pub fn remaining(&self) -> &[String] {
        &self.remaining
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).map_err(|_| {
            EngineError::application(
                axum::http::StatusCode::BAD_REQUEST,
                "request body is not valid UTF-8",
            )
        })
    }

    /// Body deserialized from JSON. Malformed input is a 400.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|err| {
            EngineError::application(axum::http::StatusCode::BAD_REQUEST, err.to_string())
        })
    }

    /// Registry ID of this request.
    pub fn id(&self) -> RequestId {
        self.tracked.id
    }

    /// Correlation ID, if a `request_id` interceptor ran.
    pub fn correlation_id(&self) -> Option<&str> {
        self.ctx
            .extensions
            .get::<CorrelationId>()
            .map(|c| c.0.as_str())
    }

    pub fn tracked(&self) -> &Arc<TrackedRequest> {
        &self.tracked
    }

    /// Queue a header for the response this request will produce.
    pub fn add_response_header(&self, name: &str, value: impl Into<Bytes>) {
        self.tracked.add_response_header(name, value);
    }

    /// Queue a cookie for the response this request will produce.
    pub fn set_cookie(&self, cookie: &SetCookie) {
        self.tracked.add_response_header("set-cookie", cookie.value());
    }
}
