//! In-flight request registry.
//!
//! # Responsibilities
//! - Give each request a unique identity for its lifetime
//! - Answer "which request is this connection serving?" for any stage
//! - Per-tag counts for monitoring
//!
//! # Design Decisions
//! - Lock-free maps (`DashMap`); no lock is held across an `.await`
//! - Cleanup is tied to a drop guard so every exit path unregisters
//! - "Current request" is keyed by the connection ID the context carries

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::net::ConnectionId;
use crate::observability::metrics;
use crate::protocol::{ConnectionContext, HeaderList};

/// Unique identifier of a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One in-flight request.
#[derive(Debug)]
pub struct TrackedRequest {
    pub id: RequestId,
    pub context: ConnectionContext,
    pub created_at: DateTime<Utc>,
    /// Grouping label for counts, usually the first path segment.
    pub tag: Option<String>,
    response_headers: Mutex<HeaderList>,
}

impl TrackedRequest {
    /// Queue a header for the eventual response.
    pub fn add_response_header(&self, name: &str, value: impl Into<bytes::Bytes>) {
        if let Ok(mut headers) = self.response_headers.lock() {
            headers.append(name, value);
        }
    }

    /// Take every queued response header.
    pub fn take_response_headers(&self) -> HeaderList {
        self.response_headers
            .lock()
            .map(|mut headers| std::mem::take(&mut *headers))
            .unwrap_or_default()
    }

    /// Time since the request was registered.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Registry of in-flight requests.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    entries: DashMap<RequestId, Arc<TrackedRequest>>,
    current: DashMap<ConnectionId, RequestId>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request for `ctx` and make it the connection's current one.
    pub fn create(&self, ctx: &ConnectionContext, tag: Option<String>) -> Arc<TrackedRequest> {
        let request = Arc::new(TrackedRequest {
            id: RequestId::new(),
            context: ctx.clone(),
            created_at: Utc::now(),
            tag,
            response_headers: Mutex::new(HeaderList::new()),
        });
        self.entries.insert(request.id, Arc::clone(&request));
        self.current.insert(ctx.id, request.id);
        metrics::set_in_flight(self.entries.len());

        tracing::trace!(
            request_id = %request.id,
            connection = %ctx.id,
            "Request registered"
        );
        request
    }

    /// Remove a request. Removing an unknown or already removed ID is a no-op.
    pub fn unregister(&self, id: RequestId) -> Option<Arc<TrackedRequest>> {
        let (_, request) = self.entries.remove(&id)?;
        self.current
            .remove_if(&request.context.id, |_, current| *current == id);
        metrics::set_in_flight(self.entries.len());
        Some(request)
    }

    pub fn get(&self, id: RequestId) -> Option<Arc<TrackedRequest>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// The request the connection described by `ctx` is serving.
    pub fn current(&self, ctx: &ConnectionContext) -> Option<Arc<TrackedRequest>> {
        let id = *self.current.get(&ctx.id)?;
        self.get(id)
    }

    /// Live requests grouped by tag.
    pub fn count_by_tag(&self) -> HashMap<Option<String>, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.iter() {
            *counts.entry(entry.value().tag.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Live requests carrying `tag`.
    pub fn count_tag(&self, tag: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().tag.as_deref() == Some(tag))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register and return a guard that unregisters on drop.
    pub fn track(self: &Arc<Self>, ctx: &ConnectionContext, tag: Option<String>) -> TrackedGuard {
        let request = self.create(ctx, tag);
        TrackedGuard {
            registry: Arc::clone(self),
            request,
        }
    }
}

/// Unregisters its request when dropped.
#[derive(Debug)]
pub struct TrackedGuard {
    registry: Arc<RequestRegistry>,
    request: Arc<TrackedRequest>,
}

impl TrackedGuard {
    pub fn request(&self) -> &Arc<TrackedRequest> {
        &self.request
    }

    pub fn id(&self) -> RequestId {
        self.request.id
    }
}

impl Drop for TrackedGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.request.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    #[test]
    fn guard_unregisters_on_drop() {
        let registry = Arc::new(RequestRegistry::new());
        let ctx = ConnectionContext::http(Method::GET, "/a");
        {
            let guard = registry.track(&ctx, Some("api".into()));
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.current(&ctx).unwrap().id, guard.id());
        }
        assert!(registry.is_empty());
        assert!(registry.current(&ctx).is_none());
    }

    #[test]
    fn double_unregister_is_a_no_op() {
        let registry = RequestRegistry::new();
        let ctx = ConnectionContext::http(Method::GET, "/a");
        let request = registry.create(&ctx, None);
        assert!(registry.unregister(request.id).is_some());
        assert!(registry.unregister(request.id).is_none());
    }

    #[test]
    fn counts_by_tag() {
        let registry = RequestRegistry::new();
        for tag in ["api", "api", "static"] {
            let ctx = ConnectionContext::http(Method::GET, "/");
            registry.create(&ctx, Some(tag.to_string()));
        }
        registry.create(&ConnectionContext::http(Method::GET, "/"), None);

        let counts = registry.count_by_tag();
        assert_eq!(counts[&Some("api".to_string())], 2);
        assert_eq!(counts[&None], 1);
        assert_eq!(registry.count_tag("static"), 1);
    }

    #[test]
    fn response_headers_are_taken_once() {
        let registry = RequestRegistry::new();
        let request = registry.create(&ConnectionContext::http(Method::GET, "/"), None);
        request.add_response_header("x-trace", "1");
        assert_eq!(request.take_response_headers().get("x-trace"), Some("1"));
        assert!(request.take_response_headers().is_empty());
    }

    #[tokio::test]
    async fn guard_cleans_up_when_task_panics() {
        let registry = Arc::new(RequestRegistry::new());
        let task_registry = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            let _guard = task_registry.track(&ConnectionContext::http(Method::GET, "/"), None);
            panic!("handler blew up");
        });
        assert!(handle.await.is_err());
        assert!(registry.is_empty());
    }
}
