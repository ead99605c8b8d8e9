//! switchyard: a connection-protocol engine.
//!
//! Turns transport connections into structured lifecycle, request/response
//! and message-stream exchanges, runs them through a configurable
//! interceptor pipeline and dispatches them to resolved handlers.

// Protocol core
pub mod error;
pub mod protocol;

// Request handling
pub mod dispatch;
pub mod engine;
pub mod http;
pub mod middleware;
pub mod routing;

// Runtime support
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod workers;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use http::{HttpServer, Response};
pub use lifecycle::Shutdown;
pub use protocol::{App, ConnectionContext, Inbound, Outbound};
