//! Route resolution contract and the reference route table.
//!
//! # Responsibilities
//! - Define the `Resolver` interface the dispatcher consumes
//! - Define the route node and the five named resolution failures
//! - Provide `RouteTable`, a best-match prefix table implementing `Resolver`
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Deepest matching prefix wins; ties go to the first registered route
//! - Explicit failure values rather than a silent default route
//! - Failure → status mapping is not a router concern (see `dispatch`)

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::http::StatusCode;
use thiserror::Error;

use crate::dispatch::handler::{Handler, StreamHandler};
use crate::protocol::{HeaderList, QueryParams};
use crate::routing::matcher::{split_segments, ExactMatcher, Matcher, PrefixMatcher};

/// Named outcomes of a failed resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveFailure {
    #[error("not found")]
    NotFound,
    #[error("not authorized")]
    NotAuthorized,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("not available")]
    NotAvailable,
    #[error("validation error: {0}")]
    Validation(String),
}

impl ResolveFailure {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveFailure::NotFound => "not_found",
            ResolveFailure::NotAuthorized => "not_authorized",
            ResolveFailure::NotAuthenticated => "not_authenticated",
            ResolveFailure::NotAvailable => "not_available",
            ResolveFailure::Validation(_) => "validation",
        }
    }
}

/// Capability names the deployment enables (e.g. `read`, `write`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Declared properties of a route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMetadata {
    /// Media type of successful responses.
    pub mime_type: Option<String>,
    /// Success status (default 200).
    pub status: Option<StatusCode>,
    /// Extra response headers.
    pub headers: HeaderList,
    /// Every tag here must be held by the caller.
    pub required_tags: Vec<String>,
}

impl RouteMetadata {
    /// Overlay `over` on `self`; fields set in `over` win.
    pub fn merge(&self, over: &RouteMetadata) -> RouteMetadata {
        let mut headers = self.headers.clone();
        for (name, _) in over.headers.iter() {
            headers.remove(name);
        }
        headers.extend(over.headers.clone());

        RouteMetadata {
            mime_type: over.mime_type.clone().or_else(|| self.mime_type.clone()),
            status: over.status.or(self.status),
            headers,
            required_tags: if over.required_tags.is_empty() {
                self.required_tags.clone()
            } else {
                over.required_tags.clone()
            },
        }
    }
}

/// The thing a route node points at.
#[derive(Clone)]
pub enum RouteHandler {
    Http(Arc<dyn Handler>),
    WebSocket(Arc<dyn StreamHandler>),
}

impl std::fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteHandler::Http(_) => f.write_str("RouteHandler::Http"),
            RouteHandler::WebSocket(_) => f.write_str("RouteHandler::WebSocket"),
        }
    }
}

/// Result of resolving one request path. Read-only once produced.
#[derive(Debug, Clone)]
pub struct RouteNode {
    handler: RouteHandler,
    metadata: RouteMetadata,
    remaining: Vec<String>,
    query: QueryParams,
}

impl RouteNode {
    pub fn new(handler: RouteHandler, metadata: RouteMetadata, remaining: Vec<String>) -> Self {
        Self {
            handler,
            metadata,
            remaining,
            query: QueryParams::default(),
        }
    }

    /// Attach the parsed query. Consumes the node, so it is only possible
    /// while the node is still being produced.
    pub fn with_query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    pub fn handler(&self) -> &RouteHandler {
        &self.handler
    }

    pub fn metadata(&self) -> &RouteMetadata {
        &self.metadata
    }

    /// Path segments below the matched route.
    pub fn remaining(&self) -> &[String] {
        &self.remaining
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }
}

/// Interface to the routing library.
pub trait Resolver: Send + Sync {
    fn resolve(
        &self,
        path: &str,
        auth_tags: &[String],
        capabilities: &Capabilities,
    ) -> Result<RouteNode, ResolveFailure>;
}

/// A compiled route.
#[derive(Debug)]
struct Route {
    pattern: String,
    matcher: Box<dyn Matcher>,
    handler: RouteHandler,
    metadata: RouteMetadata,
    capability: Option<String>,
}

/// Options for registering a route.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub metadata: RouteMetadata,
    /// Reject paths with segments below the pattern.
    pub exact: bool,
    /// Capability that must be enabled for the route to be served.
    pub capability: Option<String>,
}

/// Best-match prefix route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request/response route.
    pub fn http(self, pattern: &str, handler: impl Handler) -> Self {
        self.add(pattern, RouteHandler::Http(Arc::new(handler)), RouteOptions::default())
    }

    /// Register a stream route.
    pub fn websocket(self, pattern: &str, handler: impl StreamHandler) -> Self {
        self.add(
            pattern,
            RouteHandler::WebSocket(Arc::new(handler)),
            RouteOptions::default(),
        )
    }

    /// Register a route with explicit options.
    pub fn add(mut self, pattern: &str, handler: RouteHandler, options: RouteOptions) -> Self {
        let matcher: Box<dyn Matcher> = if options.exact {
            Box::new(ExactMatcher::new(pattern))
        } else {
            Box::new(PrefixMatcher::new(pattern))
        };
        self.routes.push(Route {
            pattern: pattern.to_string(),
            matcher,
            handler,
            metadata: options.metadata,
            capability: options.capability,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered patterns, in registration order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.pattern.as_str())
    }
}

impl Resolver for RouteTable {
    fn resolve(
        &self,
        path: &str,
        auth_tags: &[String],
        capabilities: &Capabilities,
    ) -> Result<RouteNode, ResolveFailure> {
        let segments = split_segments(path);
        if let Some(bad) = segments.iter().find(|s| **s == ".." || s.contains('\0')) {
            return Err(ResolveFailure::Validation(format!("invalid path segment {bad:?}")));
        }

        // Deepest match wins; `max_by_key` keeps the last maximum, so scan in reverse.
        let (route, consumed) = self
            .routes
            .iter()
            .rev()
            .filter_map(|r| r.matcher.consumed(&segments).map(|n| (r, n)))
            .max_by_key(|(_, n)| *n)
            .ok_or(ResolveFailure::NotFound)?;

        if let Some(capability) = &route.capability {
            if !capabilities.contains(capability) {
                return Err(ResolveFailure::NotAvailable);
            }
        }

        let required = &route.metadata.required_tags;
        if !required.is_empty() {
            if auth_tags.is_empty() {
                return Err(ResolveFailure::NotAuthenticated);
            }
            if !required.iter().all(|tag| auth_tags.contains(tag)) {
                return Err(ResolveFailure::NotAuthorized);
            }
        }

        let remaining = segments[consumed..].iter().map(|s| s.to_string()).collect();
        Ok(RouteNode::new(route.handler.clone(), route.metadata.clone(), remaining))
    }
}
