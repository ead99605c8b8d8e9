//! Connection bookkeeping shared by the transport adapter and the engine.
//!
//! # Responsibilities
//! - Hand out process-unique connection IDs
//! - Count open connections so shutdown can wait for them to drain

pub mod connection;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
