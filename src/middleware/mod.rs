//! Middleware pipeline.
//!
//! # Responsibilities
//! - Map middleware names to factories (`MiddlewareRegistry`)
//! - Compose the declared list into one nested `App` around the dispatcher
//! - Reject unknown names and bad options before any connection is served
//!
//! # Data Flow
//! ```text
//! [[middleware]] (declared order: a, b, c)
//!     → Pipeline::build (wraps in reverse: c, then b, then a)
//!     → a(b(c(dispatcher)))
//!
//! connection:  a → b → c → dispatcher
//! response:    dispatcher → c → b → a → transport
//! ```
//!
//! # Design Decisions
//! - The first declared stage is the outermost
//! - Factories are registered explicitly via `register_builtin_middleware`;
//!   nothing registers itself as a side effect of being linked in
//! - Interceptors are either pass-through (stream the response) or
//!   buffering (hold the whole body); a buffering stage wrapping another
//!   buffering stage is allowed but warned about at build time

pub mod auth;
pub mod cache;
pub mod cors;
pub mod errors;
pub mod gzip;
pub mod logging;
pub mod outbound;
pub mod request_id;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::config::{ConfigError, MiddlewareConfig};
use crate::error::Result;
use crate::protocol::{App, ConnectionContext, Inbound, Outbound};
use crate::workers::WorkerPool;

/// How an interceptor treats the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareKind {
    /// Forwards response messages as they arrive.
    PassThrough,
    /// Holds the complete body before forwarding.
    Buffering,
}

/// Everything a factory may use to build its stage.
pub struct BuildContext<'a> {
    /// Stage name, for error messages.
    pub name: &'a str,
    /// The entry's `options` table.
    pub options: &'a toml::Table,
    /// Expose error traces in responses.
    pub debug: bool,
    /// Pool for CPU-bound work, when one is configured.
    pub workers: Option<Arc<dyn WorkerPool>>,
}

impl BuildContext<'_> {
    /// Deserialize the options table into a typed options struct.
    pub fn options<T: DeserializeOwned>(&self) -> std::result::Result<T, ConfigError> {
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|err: toml::de::Error| ConfigError::MiddlewareOptions {
                name: self.name.to_string(),
                message: err.to_string(),
            })
    }
}

type BuildFn = dyn Fn(Box<dyn App>, &BuildContext<'_>) -> std::result::Result<Box<dyn App>, ConfigError>
    + Send
    + Sync;

/// Builds one pipeline stage around an inner app.
#[derive(Clone)]
pub struct MiddlewareFactory {
    pub kind: MiddlewareKind,
    build: Arc<BuildFn>,
}

impl MiddlewareFactory {
    pub fn new<F>(kind: MiddlewareKind, build: F) -> Self
    where
        F: Fn(Box<dyn App>, &BuildContext<'_>) -> std::result::Result<Box<dyn App>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            kind,
            build: Arc::new(build),
        }
    }

    pub fn build(
        &self,
        inner: Box<dyn App>,
        ctx: &BuildContext<'_>,
    ) -> std::result::Result<Box<dyn App>, ConfigError> {
        (self.build)(inner, ctx)
    }
}

impl std::fmt::Debug for MiddlewareFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareFactory")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Name → factory table.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareRegistry {
    factories: BTreeMap<String, MiddlewareFactory>,
}

impl MiddlewareRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in interceptor registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtin_middleware(&mut registry);
        registry
    }

    /// Register (or replace) a factory under `name`.
    pub fn register(&mut self, name: &str, factory: MiddlewareFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Option<&MiddlewareFactory> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Register every built-in interceptor.
pub fn register_builtin_middleware(registry: &mut MiddlewareRegistry) {
    registry.register("errors", errors::factory());
    registry.register("request_id", request_id::factory());
    registry.register("logging", logging::factory());
    registry.register("cors", cors::factory());
    registry.register("auth", auth::factory());
    registry.register("cache", cache::factory());
    registry.register("gzip", gzip::factory());
}

/// Settings shared by every stage of one pipeline build.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub debug: bool,
    pub workers: Option<Arc<dyn WorkerPool>>,
}

/// The composed interceptor chain around the dispatcher.
pub struct Pipeline {
    app: Box<dyn App>,
    stages: Vec<String>,
}

impl Pipeline {
    /// Compose `specs` around `inner`. The first entry ends up outermost.
    pub fn build(
        specs: &[MiddlewareConfig],
        registry: &MiddlewareRegistry,
        inner: Box<dyn App>,
        settings: &PipelineSettings,
    ) -> std::result::Result<Self, ConfigError> {
        // 1. Every name must be known before anything is built
        let factories = specs
            .iter()
            .map(|spec| {
                registry
                    .get(&spec.name)
                    .map(|factory| (spec, factory))
                    .ok_or_else(|| ConfigError::UnknownMiddleware(spec.name.clone()))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // 2. Warn about buffering stages nested inside each other
        let buffering: Vec<&str> = factories
            .iter()
            .filter(|(_, factory)| factory.kind == MiddlewareKind::Buffering)
            .map(|(spec, _)| spec.name.as_str())
            .collect();
        for pair in buffering.windows(2) {
            tracing::warn!(
                outer = pair[0],
                inner = pair[1],
                "Buffering middleware wraps another buffering middleware; the body is held twice"
            );
        }

        // 3. Wrap, innermost first
        let mut app = inner;
        for (spec, factory) in factories.iter().rev() {
            let ctx = BuildContext {
                name: &spec.name,
                options: &spec.options,
                debug: settings.debug,
                workers: settings.workers.clone(),
            };
            app = factory.build(app, &ctx)?;
        }

        let stages: Vec<String> = specs.iter().map(|spec| spec.name.clone()).collect();
        tracing::info!(stages = ?stages, "Middleware pipeline built");
        Ok(Self { app, stages })
    }

    /// A pipeline with no interceptors.
    pub fn bare(inner: Box<dyn App>) -> Self {
        Self {
            app: inner,
            stages: Vec::new(),
        }
    }

    /// Stage names, outermost first.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }
}

impl App for Pipeline {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        self.app.call(ctx, inbound, outbound)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("stages", &self.stages).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{handler_fn, Dispatcher, HandlerOutput};
    use crate::http::Request;
    use crate::protocol::channel::{RecordingOutbound, ScriptedInbound};
    use crate::routing::{RouteHandler, RouteMetadata, RouteOptions, RouteTable};
    use axum::http::{Method, StatusCode};
    use std::sync::Mutex;

    fn spec(name: &str, options: &str) -> MiddlewareConfig {
        MiddlewareConfig {
            name: name.to_string(),
            options: toml::from_str(options).unwrap(),
        }
    }

    fn dispatcher() -> Box<dyn App> {
        let table = RouteTable::new()
            .http("/", handler_fn(|_req: Request| async move { Ok(HandlerOutput::from("home")) }))
            .add(
                "/private",
                RouteHandler::Http(Arc::new(handler_fn(|_req: Request| async move {
                    Ok(HandlerOutput::from("private"))
                }))),
                RouteOptions {
                    metadata: RouteMetadata {
                        required_tags: vec!["admin".into()],
                        ..RouteMetadata::default()
                    },
                    ..RouteOptions::default()
                },
            );
        Box::new(Dispatcher::new(Arc::new(table)))
    }

    /// Records its name on entry, so nesting order is observable.
    struct Marker {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        inner: Box<dyn App>,
    }

    impl App for Marker {
        fn call<'a>(
            &'a self,
            ctx: ConnectionContext,
            inbound: &'a mut dyn Inbound,
            outbound: &'a mut dyn Outbound,
        ) -> BoxFuture<'a, Result<()>> {
            self.log.lock().unwrap().push(self.name.clone());
            self.inner.call(ctx, inbound, outbound)
        }
    }

    fn marker_registry(log: &Arc<Mutex<Vec<String>>>) -> MiddlewareRegistry {
        let mut registry = MiddlewareRegistry::with_builtins();
        for name in ["a", "b", "c"] {
            let log = Arc::clone(log);
            registry.register(
                name,
                MiddlewareFactory::new(MiddlewareKind::PassThrough, move |inner, ctx| {
                    Ok(Box::new(Marker {
                        name: ctx.name.to_string(),
                        log: Arc::clone(&log),
                        inner,
                    }))
                }),
            );
        }
        registry
    }

    #[tokio::test]
    async fn first_declared_stage_runs_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = marker_registry(&log);
        let pipeline = Pipeline::build(
            &[spec("a", ""), spec("b", ""), spec("c", "")],
            &registry,
            dispatcher(),
            &PipelineSettings::default(),
        )
        .unwrap();

        let mut inbound = ScriptedInbound::request("");
        let mut outbound = RecordingOutbound::new();
        pipeline
            .call(ConnectionContext::http(Method::GET, "/"), &mut inbound, &mut outbound)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(pipeline.stages(), &["a", "b", "c"]);
    }

    #[test]
    fn unknown_middleware_fails_the_build() {
        let err = Pipeline::build(
            &[spec("errors", ""), spec("nope", "")],
            &MiddlewareRegistry::with_builtins(),
            dispatcher(),
            &PipelineSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMiddleware(name) if name == "nope"));
    }

    #[test]
    fn bad_options_fail_the_build() {
        let err = Pipeline::build(
            &[spec("gzip", "minimum_size = \"big\"")],
            &MiddlewareRegistry::with_builtins(),
            dispatcher(),
            &PipelineSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MiddlewareOptions { name, .. } if name == "gzip"));
    }

    #[tokio::test]
    async fn errors_cors_auth_ordering() {
        let pipeline = Pipeline::build(
            &[
                spec("errors", ""),
                spec("cors", "allow_origins = [\"https://app.example\"]"),
                spec(
                    "auth",
                    r#"
                    [tokens.good]
                    tags = ["admin"]
                    "#,
                ),
            ],
            &MiddlewareRegistry::with_builtins(),
            dispatcher(),
            &PipelineSettings::default(),
        )
        .unwrap();

        let send = |ctx: ConnectionContext| {
            let pipeline = &pipeline;
            async move {
                let mut inbound = ScriptedInbound::request("");
                let mut outbound = RecordingOutbound::new();
                pipeline.call(ctx, &mut inbound, &mut outbound).await.unwrap();
                outbound.response().unwrap()
            }
        };

        // auth short-circuits; cors (outside auth) still decorates the 401
        let rejected = send(
            ConnectionContext::http(Method::GET, "/private")
                .with_header("origin", "https://app.example")
                .with_header("authorization", "Bearer wrong"),
        )
        .await;
        assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            rejected.headers.get("access-control-allow-origin"),
            Some("https://app.example")
        );

        // anonymous callers reach the router, which reports NotAuthenticated
        let anonymous = send(ConnectionContext::http(Method::GET, "/private")).await;
        assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);

        let granted = send(
            ConnectionContext::http(Method::GET, "/private")
                .with_header("authorization", "Bearer good"),
        )
        .await;
        assert_eq!(granted.status, StatusCode::OK);
        assert_eq!(granted.body, bytes::Bytes::from_static(b"private"));
    }

    #[test]
    fn nested_buffering_stages_still_build() {
        let pipeline = Pipeline::build(
            &[spec("gzip", ""), spec("cache", "")],
            &MiddlewareRegistry::with_builtins(),
            dispatcher(),
            &PipelineSettings::default(),
        )
        .unwrap();
        assert_eq!(pipeline.stages().len(), 2);
        assert_eq!(
            MiddlewareRegistry::with_builtins().get("cache").unwrap().kind,
            MiddlewareKind::Buffering
        );
    }
}
