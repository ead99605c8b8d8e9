//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → Engine::builder (pipeline, dispatcher, workers)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → server rebuilds the pipeline and swaps it atomically
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    DispatcherConfig, EngineConfig, LifespanConfig, ListenerConfig, LogFormat, LoggingConfig,
    MiddlewareConfig, ObservabilityConfig, RouteConfig, RouteTarget, WorkerConfig,
};
pub use validation::ValidationError;
pub use watcher::ConfigWatcher;
