//! `cors`: cross-origin resource sharing.
//!
//! # Responsibilities
//! - Answer preflight requests directly, without reaching inner stages
//! - Decorate simple cross-origin responses with allow headers
//!
//! # Design Decisions
//! - Requests without `Origin` pass through untouched
//! - With credentials allowed, the concrete origin is echoed instead of `*`

use axum::http::{Method, StatusCode};
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::error::Result;
use crate::http::Response;
use crate::middleware::outbound::HeaderTap;
use crate::middleware::{MiddlewareFactory, MiddlewareKind};
use crate::protocol::{App, ConnectionContext, ConnectionKind, HeaderList, Inbound, Outbound};

/// Headers browsers always allow.
const SAFELISTED_HEADERS: &[&str] = &["accept", "accept-language", "content-language", "content-type"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsOptions {
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: u64,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allow_origins: Vec::new(),
            allow_methods: vec!["GET".to_string()],
            allow_headers: Vec::new(),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age: 600,
        }
    }
}

pub struct CorsMiddleware {
    inner: Box<dyn App>,
    options: CorsOptions,
    any_origin: bool,
    any_method: bool,
    any_header: bool,
}

impl CorsMiddleware {
    pub fn new(inner: Box<dyn App>, mut options: CorsOptions) -> Self {
        let any_origin = options.allow_origins.iter().any(|o| o == "*");
        let any_method = options.allow_methods.iter().any(|m| m == "*");
        let any_header = options.allow_headers.iter().any(|h| h == "*");
        for method in options.allow_methods.iter_mut() {
            *method = method.to_ascii_uppercase();
        }
        for header in options.allow_headers.iter_mut() {
            *header = header.to_ascii_lowercase();
        }
        Self {
            inner,
            options,
            any_origin,
            any_method,
            any_header,
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.any_origin || self.options.allow_origins.iter().any(|o| o == origin)
    }

    fn method_allowed(&self, method: &str) -> bool {
        self.any_method
            || self
                .options
                .allow_methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method))
    }

    fn headers_allowed(&self, requested: &str) -> bool {
        self.any_header
            || requested
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .all(|h| {
                    SAFELISTED_HEADERS.contains(&h.as_str()) || self.options.allow_headers.contains(&h)
                })
    }

    /// Value for `access-control-allow-origin`.
    fn allow_origin_value(&self, origin: &str) -> String {
        if self.any_origin && !self.options.allow_credentials {
            "*".to_string()
        } else {
            origin.to_string()
        }
    }

    /// Headers shared by preflight and simple responses.
    fn origin_headers(&self, origin: &str, headers: &mut HeaderList) {
        let value = self.allow_origin_value(origin);
        if value != "*" {
            headers.append("vary", "Origin");
        }
        headers.set("access-control-allow-origin", value);
        if self.options.allow_credentials {
            headers.set("access-control-allow-credentials", "true");
        }
    }

    fn preflight(&self, ctx: &ConnectionContext, origin: &str) -> Response {
        let requested_method = ctx.header("access-control-request-method").unwrap_or("");
        let requested_headers = ctx.header("access-control-request-headers").unwrap_or("");

        let mut failures = Vec::new();
        if !self.origin_allowed(origin) {
            failures.push("origin");
        }
        if !self.method_allowed(requested_method) {
            failures.push("method");
        }
        if !self.headers_allowed(requested_headers) {
            failures.push("headers");
        }
        if !failures.is_empty() {
            tracing::debug!(origin = %origin, rejected = ?failures, "CORS preflight rejected");
            let text = format!("Disallowed CORS {}", failures.join(", "));
            return Response::full(StatusCode::BAD_REQUEST, text, Some("text/plain"), HeaderList::new());
        }

        let mut headers = HeaderList::new();
        self.origin_headers(origin, &mut headers);
        let methods = if self.any_method {
            requested_method.to_string()
        } else {
            self.options.allow_methods.join(", ")
        };
        headers.set("access-control-allow-methods", methods);
        let allowed_headers = if self.any_header {
            requested_headers.to_string()
        } else {
            self.options.allow_headers.join(", ")
        };
        if !allowed_headers.is_empty() {
            headers.set("access-control-allow-headers", allowed_headers);
        }
        headers.set("access-control-max-age", self.options.max_age.to_string());
        Response::full(StatusCode::OK, "OK", Some("text/plain"), headers)
    }
}

impl App for CorsMiddleware {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        let origin = match (ctx.kind, ctx.header("origin")) {
            (ConnectionKind::Http, Some(origin)) => origin.to_string(),
            _ => return self.inner.call(ctx, inbound, outbound),
        };

        Box::pin(async move {
            // 1. Preflight
            if ctx.method == Method::OPTIONS && ctx.headers.contains("access-control-request-method") {
                return self.preflight(&ctx, &origin).send(outbound, false).await;
            }

            // 2. Simple request
            if !self.origin_allowed(&origin) {
                return self.inner.call(ctx, inbound, outbound).await;
            }
            let mut tap = HeaderTap::new(outbound, |_: &mut StatusCode, headers: &mut HeaderList| {
                self.origin_headers(&origin, headers);
                if !self.options.expose_headers.is_empty() {
                    headers.set(
                        "access-control-expose-headers",
                        self.options.expose_headers.join(", "),
                    );
                }
            });
            self.inner.call(ctx, inbound, &mut tap).await
        })
    }
}

pub(crate) fn factory() -> MiddlewareFactory {
    MiddlewareFactory::new(MiddlewareKind::PassThrough, |inner, ctx| {
        Ok(Box::new(CorsMiddleware::new(inner, ctx.options()?)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use crate::protocol::channel::{RecordedResponse, RecordingOutbound, ScriptedInbound};

    struct Ok200;

    impl App for Ok200 {
        fn call<'a>(
            &'a self,
            _ctx: ConnectionContext,
            _inbound: &'a mut dyn Inbound,
            outbound: &'a mut dyn Outbound,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(Response::text("inner").send(outbound, false))
        }
    }

    fn cors(options: CorsOptions) -> CorsMiddleware {
        CorsMiddleware::new(Box::new(Ok200), options)
    }

    async fn call(app: &CorsMiddleware, ctx: ConnectionContext) -> RecordedResponse {
        let mut inbound = ScriptedInbound::request("");
        let mut outbound = RecordingOutbound::new();
        app.call(ctx, &mut inbound, &mut outbound).await.unwrap();
        outbound.response().unwrap()
    }

    fn preflight(origin: &str, method: &str) -> ConnectionContext {
        ConnectionContext::http(Method::OPTIONS, "/items")
            .with_header("origin", origin.to_string())
            .with_header("access-control-request-method", method.to_string())
    }

    #[tokio::test]
    async fn preflight_is_answered_directly() {
        let app = cors(CorsOptions {
            allow_origins: vec!["https://a.example".into()],
            allow_methods: vec!["GET".into(), "POST".into()],
            allow_headers: vec!["X-Token".into()],
            ..CorsOptions::default()
        });

        let ok = call(
            &app,
            preflight("https://a.example", "POST").with_header("access-control-request-headers", "x-token"),
        )
        .await;
        assert_eq!(ok.status, StatusCode::OK);
        assert_eq!(ok.headers.get("access-control-allow-origin"), Some("https://a.example"));
        assert_eq!(ok.headers.get("access-control-allow-methods"), Some("GET, POST"));
        assert_eq!(ok.headers.get("access-control-max-age"), Some("600"));
        assert_eq!(ok.headers.get("vary"), Some("Origin"));
        assert_eq!(ok.body, bytes::Bytes::from_static(b"OK"));

        let bad_origin = call(&app, preflight("https://evil.example", "POST")).await;
        assert_eq!(bad_origin.status, StatusCode::BAD_REQUEST);

        let bad_method = call(&app, preflight("https://a.example", "DELETE")).await;
        assert_eq!(bad_method.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn simple_request_gets_allow_origin() {
        let app = cors(CorsOptions {
            allow_origins: vec!["*".into()],
            ..CorsOptions::default()
        });
        let response = call(
            &app,
            ConnectionContext::http(Method::GET, "/").with_header("origin", "https://b.example"),
        )
        .await;
        assert_eq!(response.headers.get("access-control-allow-origin"), Some("*"));
        assert!(!response.headers.contains("vary"));
        assert_eq!(response.body, bytes::Bytes::from_static(b"inner"));
    }

    #[tokio::test]
    async fn no_origin_passes_through() {
        let app = cors(CorsOptions::default());
        let response = call(&app, ConnectionContext::http(Method::GET, "/")).await;
        assert!(!response.headers.contains("access-control-allow-origin"));
    }
}
