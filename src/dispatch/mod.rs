//! Dispatch: the innermost pipeline stage.
//!
//! # Responsibilities
//! - Track every request in the registry for its full lifetime
//! - Resolve the path through the `Resolver` and map failures to statuses
//! - Invoke the handler and turn its output into a response
//! - Hand stream connections to stream handlers
//!
//! # Data Flow
//! ```text
//! ConnectionContext
//!     → registry.track()             (guard unregisters on every exit)
//!     → resolver.resolve()           ─ failure → failure_status() → detail response
//!     → read_body()                  (http only)
//!     → handler.call(Request)
//!     → unwrap_metadata() → Response::from_output()
//!     → ResponseGuard → outbound
//! ```
//!
//! # Design Decisions
//! - Only resolution failures are translated here; everything else bubbles
//!   to the `errors` interceptor
//! - The failure → status table lives here, not in the router

pub mod handler;
pub mod registry;

use std::sync::Arc;

use axum::http::StatusCode;
use futures_util::future::BoxFuture;

use crate::error::{EngineError, Result};
use crate::http::response::{Response, DEFAULT_FILE_CHUNK_SIZE};
use crate::http::websocket::WebSocket;
use crate::http::Request;
use crate::observability::metrics;
use crate::protocol::{
    read_body, App, ConnectionContext, ConnectionKind, HeaderList, Inbound, Outbound,
    ResponseGuard,
};
use crate::routing::matcher::split_segments;
use crate::routing::{Capabilities, ResolveFailure, Resolver, RouteHandler, RouteNode};

pub use handler::{handler_fn, stream_handler_fn, Handler, HandlerOutput, StreamHandler};
pub use registry::{RequestId, RequestRegistry, TrackedGuard, TrackedRequest};

/// Fixed mapping from resolution failure to HTTP status.
pub fn failure_status(failure: &ResolveFailure) -> StatusCode {
    match failure {
        ResolveFailure::NotFound => StatusCode::NOT_FOUND,
        ResolveFailure::NotAuthorized => StatusCode::FORBIDDEN,
        ResolveFailure::NotAuthenticated => StatusCode::UNAUTHORIZED,
        ResolveFailure::NotAvailable => StatusCode::SERVICE_UNAVAILABLE,
        ResolveFailure::Validation(_) => StatusCode::BAD_REQUEST,
    }
}

/// Client-facing text for a failure.
fn failure_detail(failure: &ResolveFailure) -> String {
    match failure {
        ResolveFailure::Validation(message) => message.clone(),
        other => failure_status(other)
            .canonical_reason()
            .unwrap_or("error")
            .to_string(),
    }
}

/// Resolves requests and runs handlers.
pub struct Dispatcher {
    resolver: Arc<dyn Resolver>,
    registry: Arc<RequestRegistry>,
    capabilities: Capabilities,
    app_tag: Option<String>,
    file_chunk_size: usize,
}

impl Dispatcher {
    /// Create a new dispatcher over `resolver` with its own registry.
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            registry: Arc::new(RequestRegistry::new()),
            capabilities: Capabilities::default(),
            app_tag: None,
            file_chunk_size: DEFAULT_FILE_CHUNK_SIZE,
        }
    }

    /// Share a registry with other components (interceptors, monitoring).
    pub fn with_registry(mut self, registry: Arc<RequestRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Tag every tracked request with `tag` instead of the first path segment.
    pub fn with_app_tag(mut self, tag: Option<String>) -> Self {
        self.app_tag = tag;
        self
    }

    pub fn with_file_chunk_size(mut self, chunk_size: usize) -> Self {
        self.file_chunk_size = chunk_size.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    fn tag_for(&self, ctx: &ConnectionContext) -> Option<String> {
        self.app_tag
            .clone()
            .or_else(|| split_segments(&ctx.path).first().map(|s| s.to_string()))
    }

    /// Resolve and check the node serves this connection kind.
    fn resolve(&self, ctx: &ConnectionContext) -> std::result::Result<RouteNode, ResolveFailure> {
        let node = self
            .resolver
            .resolve(&ctx.path, ctx.auth_tags(), &self.capabilities)?;
        let serves_kind = matches!(
            (ctx.kind, node.handler()),
            (ConnectionKind::Http, RouteHandler::Http(_))
                | (ConnectionKind::WebSocket, RouteHandler::WebSocket(_))
        );
        if !serves_kind {
            return Err(ResolveFailure::NotFound);
        }
        Ok(node.with_query(ctx.query()))
    }

    async fn dispatch_http(
        &self,
        ctx: ConnectionContext,
        inbound: &mut dyn Inbound,
        outbound: &mut dyn Outbound,
    ) -> Result<()> {
        let mut outbound = ResponseGuard::new(outbound);
        let head_only = ctx.is_head();

        // 1. Track
        let guard = self.registry.track(&ctx, self.tag_for(&ctx));

        // 2. Resolve
        let node = match self.resolve(&ctx) {
            Ok(node) => node,
            Err(failure) => {
                let status = failure_status(&failure);
                metrics::record_resolution_failure(failure.kind());
                tracing::debug!(
                    request_id = %guard.id(),
                    path = %ctx.path,
                    failure = failure.kind(),
                    status = status.as_u16(),
                    "Route resolution failed"
                );
                return Response::detail(status, &failure_detail(&failure), HeaderList::new())
                    .send(&mut outbound, head_only)
                    .await;
            }
        };
        let RouteHandler::Http(handler) = node.handler().clone() else {
            return Err(EngineError::Resolution(ResolveFailure::NotFound));
        };

        // 3. Call handler
        let body = read_body(inbound).await?;
        let request = Request::new(
            ctx,
            body,
            node.query().clone(),
            node.remaining().to_vec(),
            Arc::clone(guard.request()),
        );
        let output = handler.call(request).await?;

        // 4. Build and send
        let (output, metadata) = output.unwrap_metadata(node.metadata());
        let response = Response::from_output(output, &metadata, self.file_chunk_size)?
            .with_headers(guard.request().take_response_headers());
        response.send(&mut outbound, head_only).await
    }

    async fn dispatch_websocket(
        &self,
        ctx: ConnectionContext,
        inbound: &mut dyn Inbound,
        outbound: &mut dyn Outbound,
    ) -> Result<()> {
        let guard = self.registry.track(&ctx, self.tag_for(&ctx));

        match self.resolve(&ctx) {
            Ok(node) => {
                let RouteHandler::WebSocket(handler) = node.handler().clone() else {
                    return Err(EngineError::Resolution(ResolveFailure::NotFound));
                };
                tracing::debug!(request_id = %guard.id(), path = %ctx.path, "Stream connection dispatched");
                let socket =
                    WebSocket::new(ctx, inbound, outbound).with_remaining(node.remaining().to_vec());
                handler.call(socket).await
            }
            Err(failure) => {
                metrics::record_resolution_failure(failure.kind());
                tracing::debug!(
                    request_id = %guard.id(),
                    path = %ctx.path,
                    failure = failure.kind(),
                    "Stream connection refused"
                );
                let mut socket = WebSocket::new(ctx, inbound, outbound);
                socket.reject(&failure.to_string()).await
            }
        }
    }
}

impl App for Dispatcher {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match ctx.kind {
                ConnectionKind::Http => self.dispatch_http(ctx, inbound, outbound).await,
                ConnectionKind::WebSocket => self.dispatch_websocket(ctx, inbound, outbound).await,
                ConnectionKind::Lifespan => Err(EngineError::protocol(
                    "lifespan connections are handled by the engine",
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::websocket::POLICY_VIOLATION;
    use crate::protocol::channel::{RecordingOutbound, ScriptedInbound};
    use crate::protocol::{AuthTags, Frame, OutboundMessage};
    use crate::routing::{RouteMetadata, RouteOptions, RouteTable};
    use axum::http::Method;
    use bytes::Bytes;

    fn guarded(tag: &str) -> RouteOptions {
        RouteOptions {
            metadata: RouteMetadata {
                required_tags: vec![tag.to_string()],
                ..RouteMetadata::default()
            },
            ..RouteOptions::default()
        }
    }

    fn dispatcher() -> Dispatcher {
        let table = RouteTable::new()
            .http(
                "/echo",
                handler_fn(|req: Request| async move {
                    Ok(HandlerOutput::Text(format!(
                        "{}|{}|{}",
                        req.remaining().join("/"),
                        req.query().first("q").unwrap_or(""),
                        req.text()?
                    )))
                }),
            )
            .http(
                "/fail",
                handler_fn(|_req: Request| async move {
                    Err::<HandlerOutput, _>(EngineError::handler("boom"))
                }),
            )
            .http(
                "/cookie",
                handler_fn(|req: Request| async move {
                    req.set_cookie(&crate::http::SetCookie::new("sid", "1"));
                    Ok(HandlerOutput::from("ok"))
                }),
            )
            .add(
                "/admin",
                RouteHandler::Http(Arc::new(handler_fn(|_req: Request| async move {
                    Ok(HandlerOutput::from("secret"))
                }))),
                guarded("admin"),
            )
            .add(
                "/write",
                RouteHandler::Http(Arc::new(handler_fn(|_req: Request| async move {
                    Ok(HandlerOutput::Empty)
                }))),
                RouteOptions {
                    capability: Some("write".into()),
                    ..RouteOptions::default()
                },
            )
            .websocket(
                "/ws",
                stream_handler_fn(|mut socket| {
                    Box::pin(async move {
                        socket.accept(None, HeaderList::new()).await?;
                        while let Some(text) = socket.next_text().await? {
                            socket.send_text(text.to_uppercase()).await?;
                        }
                        Ok(())
                    })
                }),
            );
        Dispatcher::new(Arc::new(table))
    }

    async fn run(dispatcher: &Dispatcher, ctx: ConnectionContext, body: &'static str) -> RecordingOutbound {
        let mut inbound = ScriptedInbound::request(body);
        let mut outbound = RecordingOutbound::new();
        let _ = dispatcher.call(ctx, &mut inbound, &mut outbound).await;
        outbound
    }

    #[test]
    fn failure_status_table() {
        assert_eq!(failure_status(&ResolveFailure::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(failure_status(&ResolveFailure::NotAuthorized), StatusCode::FORBIDDEN);
        assert_eq!(failure_status(&ResolveFailure::NotAuthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(failure_status(&ResolveFailure::NotAvailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            failure_status(&ResolveFailure::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn handler_receives_remaining_query_and_body() {
        let d = dispatcher();
        let ctx = ConnectionContext::http(Method::POST, "/echo/a/b").with_query("q=x");
        let response = run(&d, ctx, "payload").await.response().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"a/b|x|payload"));
    }

    #[tokio::test]
    async fn resolution_failures_map_to_statuses_without_calling_handlers() {
        let d = dispatcher();
        let cases = [
            ("/missing", StatusCode::NOT_FOUND),
            ("/admin", StatusCode::UNAUTHORIZED),
            ("/write", StatusCode::SERVICE_UNAVAILABLE),
            ("/echo/../x", StatusCode::BAD_REQUEST),
        ];
        for (path, status) in cases {
            let response = run(&d, ConnectionContext::http(Method::GET, path), "")
                .await
                .response()
                .unwrap();
            assert_eq!(response.status, status, "path {path}");
            assert!(std::str::from_utf8(&response.body).unwrap().contains("detail"));
        }

        let mut ctx = ConnectionContext::http(Method::GET, "/admin");
        ctx.extensions.insert(AuthTags {
            principal: None,
            tags: vec!["reader".into()],
        });
        let response = run(&d, ctx, "").await.response().unwrap();
        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn capabilities_enable_routes() {
        let d = dispatcher().with_capabilities(Capabilities::new(["write"]));
        let response = run(&d, ConnectionContext::http(Method::POST, "/write"), "")
            .await
            .response()
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn registry_is_empty_after_success_and_failure() {
        let d = dispatcher();
        run(&d, ConnectionContext::http(Method::GET, "/echo"), "").await;
        assert!(d.registry().is_empty());

        let mut inbound = ScriptedInbound::request("");
        let mut outbound = RecordingOutbound::new();
        let err = d
            .call(ConnectionContext::http(Method::GET, "/fail"), &mut inbound, &mut outbound)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Handler(_)));
        assert!(d.registry().is_empty());
    }

    #[tokio::test]
    async fn queued_cookies_reach_the_response() {
        let d = dispatcher();
        let response = run(&d, ConnectionContext::http(Method::GET, "/cookie"), "")
            .await
            .response()
            .unwrap();
        assert_eq!(response.headers.get("set-cookie"), Some("sid=1; SameSite=lax"));
    }

    #[tokio::test]
    async fn head_request_gets_headers_only() {
        let d = dispatcher();
        let response = run(&d, ConnectionContext::http(Method::HEAD, "/echo"), "")
            .await
            .response()
            .unwrap();
        assert_eq!(response.headers.get("content-length"), Some("2"));
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn http_route_on_stream_connection_is_rejected() {
        let d = dispatcher();
        let mut inbound = ScriptedInbound::stream([]);
        let mut outbound = RecordingOutbound::new();
        d.call(ConnectionContext::websocket("/echo"), &mut inbound, &mut outbound)
            .await
            .unwrap();
        assert_eq!(outbound.names(), vec!["websocket.accept", "websocket.close"]);
        assert!(matches!(
            outbound.messages.last(),
            Some(OutboundMessage::Close { code, .. }) if *code == POLICY_VIOLATION
        ));
    }

    #[tokio::test]
    async fn stream_route_echoes_frames() {
        let d = dispatcher();
        let mut inbound = ScriptedInbound::stream([Frame::Text("hi".into())]);
        let mut outbound = RecordingOutbound::new();
        d.call(ConnectionContext::websocket("/ws"), &mut inbound, &mut outbound)
            .await
            .unwrap();
        assert_eq!(outbound.messages[1], OutboundMessage::Send(Frame::Text("HI".into())));
        assert!(d.registry().is_empty());
    }

    #[tokio::test]
    async fn tag_counts_return_to_their_prior_values() {
        let d = dispatcher();
        let _long_lived = d
            .registry()
            .track(&ConnectionContext::http(Method::GET, "/echo"), Some("echo".into()));
        let before = d.registry().count_by_tag();

        let ok = run(&d, ConnectionContext::http(Method::GET, "/echo"), "").await;
        assert_eq!(ok.response().unwrap().status, StatusCode::OK);
        assert_eq!(d.registry().count_by_tag(), before);

        let refused = run(&d, ConnectionContext::http(Method::GET, "/admin"), "").await;
        assert_eq!(refused.response().unwrap().status, StatusCode::UNAUTHORIZED);
        assert_eq!(d.registry().count_by_tag(), before);

        let mut inbound = ScriptedInbound::request("");
        let mut outbound = RecordingOutbound::new();
        let result = d
            .call(ConnectionContext::http(Method::GET, "/fail"), &mut inbound, &mut outbound)
            .await;
        assert!(result.is_err());
        assert_eq!(d.registry().count_by_tag(), before);
        assert_eq!(d.registry().count_tag("echo"), 1);
    }

    #[tokio::test]
    async fn concurrent_dispatches_each_see_their_own_request() {
        let registry = Arc::new(RequestRegistry::new());
        let both_in_flight = Arc::new(tokio::sync::Barrier::new(2));
        let (lookup, barrier) = (Arc::clone(&registry), Arc::clone(&both_in_flight));
        let table = RouteTable::new().http(
            "/whoami",
            handler_fn(move |req: Request| {
                let (registry, barrier) = (Arc::clone(&lookup), Arc::clone(&barrier));
                async move {
                    barrier.wait().await;
                    let in_flight = registry.len();
                    let current = registry
                        .current(req.context())
                        .ok_or_else(|| EngineError::handler("no current request"))?;
                    Ok(HandlerOutput::Text(format!(
                        "{}|{}",
                        current.id == req.id(),
                        in_flight
                    )))
                }
            }),
        );
        let d = Dispatcher::new(Arc::new(table)).with_registry(Arc::clone(&registry));

        let (a, b) = tokio::join!(
            run(&d, ConnectionContext::http(Method::GET, "/whoami"), ""),
            run(&d, ConnectionContext::http(Method::GET, "/whoami"), ""),
        );
        for outbound in [a, b] {
            assert_eq!(outbound.response().unwrap().body, Bytes::from_static(b"true|2"));
        }
        assert!(registry.is_empty());
    }
}
