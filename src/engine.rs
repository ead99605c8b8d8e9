//! The engine: the single `App` the transport talks to.
//!
//! # Responsibilities
//! - Answer lifespan connections with the registered hooks
//! - Run HTTP and stream connections through the current pipeline
//! - Rebuild and atomically swap the pipeline on reload
//! - Report HTTP connections that end without a complete response
//!
//! # Data Flow
//! ```text
//! transport ─▶ Engine::call
//!                ├─ lifespan  → serve_lifespan(hooks)
//!                └─ http / ws → ArcSwap<Pipeline>::load_full()
//!                                  → interceptors → Dispatcher
//! ```
//!
//! # Design Decisions
//! - Each connection keeps the pipeline it started with; a reload only
//!   affects connections accepted after the swap
//! - The request registry and worker pool outlive reloads, so in-flight
//!   lookups and pool capacity are unaffected by them
//! - A failed rebuild leaves the running pipeline in place

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;

use crate::config::{ConfigError, EngineConfig};
use crate::dispatch::{Dispatcher, RequestRegistry};
use crate::error::{EngineError, Result};
use crate::lifecycle::{serve_lifespan, HookError, LifespanHooks};
use crate::middleware::{MiddlewareRegistry, Pipeline, PipelineSettings};
use crate::protocol::{App, ConnectionContext, ConnectionKind, Inbound, Outbound, ResponseGuard};
use crate::routing::{Capabilities, Resolver, RouteTable};
use crate::workers::{BoundedPool, WorkerPool};

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    middleware: MiddlewareRegistry,
    resolver: Option<Arc<dyn Resolver>>,
    workers: Option<Arc<dyn WorkerPool>>,
    hooks: LifespanHooks,
}

impl EngineBuilder {
    /// Replace the middleware registry (defaults to the built-ins).
    pub fn middleware_registry(mut self, registry: MiddlewareRegistry) -> Self {
        self.middleware = registry;
        self
    }

    /// Use `resolver` instead of a route table built from `[[routes]]`.
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use `pool` instead of one built from `[workers]`.
    pub fn workers(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.workers = Some(pool);
        self
    }

    pub fn on_startup<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), HookError>> + Send + 'static,
    {
        self.hooks = self.hooks.on_startup(name, f);
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), HookError>> + Send + 'static,
    {
        self.hooks = self.hooks.on_shutdown(name, f);
        self
    }

    /// Build the engine. Unknown middleware or bad options fail here.
    pub fn build(self) -> std::result::Result<Engine, ConfigError> {
        let workers = self.workers.or_else(|| {
            self.config.workers.enabled.then(|| {
                Arc::new(BoundedPool::new(self.config.workers.capacity)) as Arc<dyn WorkerPool>
            })
        });
        let engine = Engine {
            pipeline: ArcSwap::from_pointee(Pipeline::bare(Box::new(Dispatcher::new(Arc::new(
                RouteTable::new(),
            ))))),
            middleware: self.middleware,
            resolver: self.resolver,
            requests: Arc::new(RequestRegistry::new()),
            workers,
            hooks: self.hooks,
            startup_timeout: Duration::from_secs(self.config.lifespan.startup_timeout_secs),
            debug: AtomicBool::new(self.config.debug),
        };
        engine.reload(&self.config)?;
        Ok(engine)
    }
}

/// Lifespan hooks plus a hot-swappable pipeline.
pub struct Engine {
    pipeline: ArcSwap<Pipeline>,
    middleware: MiddlewareRegistry,
    resolver: Option<Arc<dyn Resolver>>,
    requests: Arc<RequestRegistry>,
    workers: Option<Arc<dyn WorkerPool>>,
    hooks: LifespanHooks,
    startup_timeout: Duration,
    debug: AtomicBool,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            middleware: MiddlewareRegistry::with_builtins(),
            resolver: None,
            workers: None,
            hooks: LifespanHooks::new(),
        }
    }

    /// Rebuild the pipeline from `config` and swap it in.
    ///
    /// Listener, worker and lifespan settings are fixed at build time and
    /// ignored here.
    pub fn reload(&self, config: &EngineConfig) -> std::result::Result<(), ConfigError> {
        let resolver = match &self.resolver {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::new(RouteTable::from_config(&config.routes)?) as Arc<dyn Resolver>,
        };
        let dispatcher = Dispatcher::new(resolver)
            .with_registry(Arc::clone(&self.requests))
            .with_capabilities(Capabilities::new(config.dispatcher.capabilities.iter().cloned()))
            .with_app_tag(config.dispatcher.app_tag.clone())
            .with_file_chunk_size(config.dispatcher.file_chunk_size);
        let settings = PipelineSettings {
            debug: config.debug,
            workers: self.workers.clone(),
        };
        let pipeline = Pipeline::build(&config.middleware, &self.middleware, Box::new(dispatcher), &settings)?;

        self.pipeline.store(Arc::new(pipeline));
        self.debug.store(config.debug, Ordering::SeqCst);
        tracing::info!(routes = config.routes.len(), "Pipeline swapped in");
        Ok(())
    }

    /// Requests currently in flight.
    pub fn requests(&self) -> &Arc<RequestRegistry> {
        &self.requests
    }

    /// Stage names of the current pipeline, outermost first.
    pub fn stages(&self) -> Vec<String> {
        self.pipeline.load().stages().to_vec()
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }
}

impl App for Engine {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match ctx.kind {
                ConnectionKind::Lifespan => {
                    serve_lifespan(&self.hooks, self.startup_timeout, inbound, outbound).await
                }
                ConnectionKind::WebSocket => {
                    let pipeline = self.pipeline.load_full();
                    pipeline.call(ctx, inbound, outbound).await
                }
                ConnectionKind::Http => {
                    let pipeline = self.pipeline.load_full();
                    let mut guard = ResponseGuard::new(outbound);
                    pipeline.call(ctx, inbound, &mut guard).await?;
                    if !guard.is_complete() {
                        return Err(EngineError::protocol(
                            "application returned without completing a response",
                        ));
                    }
                    Ok(())
                }
            }
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stages", &self.stages())
            .field("hooks", &self.hooks)
            .field("in_flight", &self.requests.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, MiddlewareConfig};
    use crate::lifecycle::LifespanClient;
    use crate::middleware::{MiddlewareFactory, MiddlewareKind};
    use crate::protocol::channel::{RecordingOutbound, ScriptedInbound};
    use axum::http::{Method, StatusCode};
    use bytes::Bytes;

    fn config(text: &str) -> EngineConfig {
        parse_config(text).unwrap()
    }

    async fn get(engine: &Engine, path: &str) -> Result<RecordingOutbound> {
        let mut inbound = ScriptedInbound::request("");
        let mut outbound = RecordingOutbound::new();
        engine
            .call(ConnectionContext::http(Method::GET, path), &mut inbound, &mut outbound)
            .await?;
        Ok(outbound)
    }

    #[tokio::test]
    async fn serves_configured_routes_through_the_pipeline() {
        let engine = Engine::builder(config(
            r#"
            [[middleware]]
            name = "errors"

            [[middleware]]
            name = "request_id"

            [[routes]]
            path = "/hello"
            kind = "text"
            body = "hello"
            "#,
        ))
        .build()
        .unwrap();

        assert_eq!(engine.stages(), vec!["errors", "request_id"]);
        let response = get(&engine, "/hello").await.unwrap().response().unwrap();
        assert_eq!(response.body, Bytes::from_static(b"hello"));
        assert!(response.headers.contains("x-request-id"));

        let missing = get(&engine, "/nope").await.unwrap().response().unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert!(engine.requests().is_empty());
    }

    #[tokio::test]
    async fn reload_swaps_routes_and_keeps_old_pipeline_on_failure() {
        let engine = Engine::builder(config(
            r#"
            [[routes]]
            path = "/v"
            kind = "text"
            body = "one"
            "#,
        ))
        .build()
        .unwrap();

        engine
            .reload(&config(
                r#"
                [[routes]]
                path = "/v"
                kind = "text"
                body = "two"
                "#,
            ))
            .unwrap();
        let body = get(&engine, "/v").await.unwrap().response().unwrap().body;
        assert_eq!(body, Bytes::from_static(b"two"));

        let mut broken = EngineConfig::default();
        broken.middleware.push(MiddlewareConfig::named("does_not_exist"));
        assert!(matches!(engine.reload(&broken), Err(ConfigError::UnknownMiddleware(_))));
        let body = get(&engine, "/v").await.unwrap().response().unwrap().body;
        assert_eq!(body, Bytes::from_static(b"two"));
    }

    /// Returns without sending anything.
    struct Silent;

    impl App for Silent {
        fn call<'a>(
            &'a self,
            _ctx: ConnectionContext,
            _inbound: &'a mut dyn Inbound,
            _outbound: &'a mut dyn Outbound,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn missing_response_is_a_protocol_error() {
        let mut registry = MiddlewareRegistry::with_builtins();
        registry.register(
            "silent",
            MiddlewareFactory::new(MiddlewareKind::PassThrough, |_inner, _ctx| Ok(Box::new(Silent))),
        );
        let mut cfg = EngineConfig::default();
        cfg.middleware.push(MiddlewareConfig::named("silent"));
        let engine = Engine::builder(cfg).middleware_registry(registry).build().unwrap();

        let err = get(&engine, "/").await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn lifespan_runs_hooks_over_channels() {
        let engine = Engine::builder(EngineConfig::default())
            .on_startup("ready", || async { Ok(()) })
            .build()
            .unwrap();
        let mut client = LifespanClient::spawn(Arc::new(engine));
        client.startup().await.unwrap();
        client.shutdown().await.unwrap();
    }
}
