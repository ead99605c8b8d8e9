//! Error taxonomy for the engine.
//!
//! # Design Decisions
//! - One error type flows through every pipeline stage so the outermost
//!   `errors` interceptor can translate all of them
//! - Redirects and disconnects are modelled as variants even though they are
//!   not failures; callers match on them explicitly
//! - Startup problems live in `config::ConfigError`, never here

use thiserror::Error;

use crate::protocol::{FrameKind, HeaderList};
use crate::routing::ResolveFailure;

/// Main error type for all connection handling.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Not a failure: instructs the client to go elsewhere.
    #[error("redirect to {location} ({status})")]
    Redirect {
        status: axum::http::StatusCode,
        location: String,
    },

    /// Explicit application failure surfaced verbatim to the client.
    #[error("{status}: {detail}")]
    Application {
        status: axum::http::StatusCode,
        detail: String,
        headers: HeaderList,
    },

    /// The router refused to produce a route node.
    #[error("route resolution failed: {0}")]
    Resolution(#[from] ResolveFailure),

    /// Anything a handler raised that is not one of the typed variants.
    #[error("unhandled handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Out-of-phase or malformed message on a connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer went away. A cleanup signal, not a failure.
    #[error("client disconnected (code {code})")]
    Disconnect { code: u16 },

    /// A stream frame of the wrong type was received.
    #[error("expected a {expected} frame, received {actual}")]
    FrameType { expected: FrameKind, actual: FrameKind },

    /// Worker pool admission refused.
    #[error("worker pool at capacity ({capacity} jobs)")]
    Overloaded { capacity: usize },

    /// I/O error while producing a response body.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Close code used when the transport disappears without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

impl EngineError {
    /// Application error with no extra headers.
    pub fn application(status: axum::http::StatusCode, detail: impl Into<String>) -> Self {
        EngineError::Application {
            status,
            detail: detail.into(),
            headers: HeaderList::new(),
        }
    }

    /// Temporary redirect (307).
    pub fn redirect(location: impl Into<String>) -> Self {
        EngineError::Redirect {
            status: axum::http::StatusCode::TEMPORARY_REDIRECT,
            location: location.into(),
        }
    }

    /// Wrap an arbitrary error as an unhandled handler failure.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        EngineError::Handler(err.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError::Protocol(message.into())
    }

    /// True for the normal-termination signal.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, EngineError::Disconnect { .. })
    }

    /// Render the error and its full source chain for debug responses.
    pub fn trace(&self) -> String {
        use std::error::Error as _;

        let mut out = format!("{self}\n\n{self:?}");
        let mut source = self.source();
        while let Some(cause) = source {
            out.push_str(&format!("\n\ncaused by: {cause}"));
            source = cause.source();
        }
        out
    }
}

/// Result type alias using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;
