//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher
//!     → Resolver::resolve(path, auth tags, capabilities)
//!     → router.rs (deepest prefix match, tag and capability checks)
//!     → matcher.rs (segment matching)
//!     → RouteNode | ResolveFailure
//!
//! [[routes]] config
//!     → targets.rs (RouteTable::from_config, built-in handlers)
//! ```
//!
//! # Design Decisions
//! - The engine only depends on the `Resolver` trait; `RouteTable` is one
//!   implementation of it
//! - Routes compiled at startup, immutable at runtime
//! - Deterministic: same input always matches same route

pub mod matcher;
pub mod router;
pub mod targets;

pub use router::{
    Capabilities, ResolveFailure, Resolver, RouteHandler, RouteMetadata, RouteNode, RouteOptions,
    RouteTable,
};
pub use targets::EchoSocket;
