//! HTTP and WebSocket protocol handling.
//!
//! # Data Flow
//! ```text
//! axum request / upgrade
//!     → server.rs (adapter: axum ⇄ Inbound/Outbound channels)
//!     → Engine (pipeline → dispatcher)
//!     → request.rs (handler view of the request)
//!     → response.rs (framing: buffered, streamed, file)
//!     → conditional.rs / cookie.rs (header semantics)
//!     → websocket.rs (stream state machine)
//! ```

pub mod conditional;
pub mod cookie;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use cookie::{SameSite, SetCookie};
pub use request::{CorrelationId, Request, X_REQUEST_ID};
pub use response::{Body, BodyStream, Response};
pub use server::{HttpServer, ServerError};
pub use websocket::{WebSocket, WebSocketState, NORMAL_CLOSURE, POLICY_VIOLATION};
