//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Lifespan (lifespan.rs):
//!     startup → hooks → startup-complete | startup-failed
//!     shutdown → hooks → shutdown-complete
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Lifespan shutdown → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, run shutdown hooks
//! - Draining has a deadline; connections still open after it are dropped

pub mod lifespan;
pub mod shutdown;
pub mod signals;

pub use lifespan::{serve_lifespan, HookError, LifespanClient, LifespanError, LifespanHooks};
pub use shutdown::Shutdown;
pub use signals::{spawn_signal_handler, wait_for_signal};
