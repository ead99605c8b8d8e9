//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacities > 0, addresses parse)
//! - Detect conflicting routes
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: `&EngineConfig → Result<(), Vec<ValidationError>>`
//! - Middleware names and options are checked when the pipeline is built,
//!   where the registry is known

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::schema::{EngineConfig, RouteTarget};

/// One semantic problem in a config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path to the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("`{}` is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if config.listener.channel_capacity == 0 {
        errors.push(ValidationError::new("listener.channel_capacity", "must be greater than 0"));
    }
    if config.dispatcher.file_chunk_size == 0 {
        errors.push(ValidationError::new("dispatcher.file_chunk_size", "must be greater than 0"));
    }
    if config.workers.enabled && config.workers.capacity == 0 {
        errors.push(ValidationError::new("workers.capacity", "must be greater than 0 when enabled"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("`{}` is not a socket address", config.observability.metrics_address),
        ));
    }
    if let Err(err) = EnvFilter::try_new(&config.logging.level) {
        errors.push(ValidationError::new("logging.level", err.to_string()));
    }

    let mut seen = HashSet::new();
    for (i, route) in config.routes.iter().enumerate() {
        let field = format!("routes[{i}]");
        if !route.path.starts_with('/') {
            errors.push(ValidationError::new(
                format!("{field}.path"),
                format!("`{}` must start with '/'", route.path),
            ));
        }
        if !seen.insert(route.path.trim_end_matches('/').to_string()) {
            errors.push(ValidationError::new(
                format!("{field}.path"),
                format!("duplicate route `{}`", route.path),
            ));
        }
        if let Some(status) = route.status {
            if !(100..=599).contains(&status) {
                errors.push(ValidationError::new(
                    format!("{field}.status"),
                    format!("{status} is not an HTTP status"),
                ));
            }
        }
        if let RouteTarget::Redirect { location, .. } = &route.target {
            if location.is_empty() {
                errors.push(ValidationError::new(format!("{field}.location"), "must not be empty"));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
