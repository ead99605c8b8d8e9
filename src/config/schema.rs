//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from TOML files, and
//! every section has defaults so a minimal file is a valid one.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Expose error traces in 500 responses.
    pub debug: bool,

    /// Interceptors, outermost first.
    pub middleware: Vec<MiddlewareConfig>,

    /// Reference route table entries.
    pub routes: Vec<RouteConfig>,

    /// Dispatcher settings.
    pub dispatcher: DispatcherConfig,

    /// Worker pool for CPU-bound body transforms.
    pub workers: WorkerConfig,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Metrics settings.
    pub observability: ObservabilityConfig,

    /// Startup/shutdown protocol settings.
    pub lifespan: LifespanConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Largest accepted request body, in bytes.
    pub max_body_bytes: usize,

    /// Buffered messages per direction on each connection channel.
    pub channel_capacity: usize,

    /// Time open connections get to finish after shutdown starts.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            channel_capacity: 16,
            drain_timeout_secs: 30,
        }
    }
}

/// One `[[middleware]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MiddlewareConfig {
    /// Registered interceptor name.
    pub name: String,

    /// Interceptor-specific options, checked by its factory.
    #[serde(default)]
    pub options: toml::Table,
}

impl MiddlewareConfig {
    /// Entry with no options.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            options: toml::Table::new(),
        }
    }
}

/// What a configured route serves.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteTarget {
    /// Fixed text body.
    Text { body: String },
    /// One file.
    File { path: PathBuf },
    /// Files below a directory, addressed by the remaining path segments.
    Static { root: PathBuf },
    /// Redirect to a fixed location.
    Redirect {
        location: String,
        #[serde(default)]
        permanent: bool,
    },
    /// Echo the request body back.
    Echo,
    /// Echo every stream frame back.
    WebsocketEcho,
}

/// Route configuration for the reference route table.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteConfig {
    /// Path prefix, e.g. "/api/items".
    pub path: String,

    #[serde(flatten)]
    pub target: RouteTarget,

    /// Reject paths with segments below `path`.
    #[serde(default)]
    pub exact: bool,

    /// Tags the caller must hold.
    #[serde(default)]
    pub required_tags: Vec<String>,

    /// Capability that must be enabled on the dispatcher.
    #[serde(default)]
    pub capability: Option<String>,

    /// Media type of successful responses.
    #[serde(default)]
    pub mime_type: Option<String>,

    /// Success status override.
    #[serde(default)]
    pub status: Option<u16>,

    /// Extra response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Capabilities passed to the router.
    pub capabilities: Vec<String>,

    /// Tag for tracked requests; defaults to the first path segment.
    pub app_tag: Option<String>,

    /// Read size for file-backed bodies, in bytes.
    pub file_chunk_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            app_tag: None,
            file_chunk_size: 64 * 1024,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,

    /// Concurrently running jobs; submissions beyond this are refused.
    pub capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 4,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives (e.g. "info" or "switchyard=debug,tower_http=info").
    pub level: String,

    pub format: LogFormat,

    /// Include the event target in pretty output.
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "switchyard=info,tower_http=info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Startup/shutdown protocol configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifespanConfig {
    /// Run the lifespan protocol around serving.
    pub enabled: bool,

    /// Startup hooks must finish within this many seconds.
    pub startup_timeout_secs: u64,
}

impl Default for LifespanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_timeout_secs: 30,
        }
    }
}
