//! `cache`: validators and conditional GET.
//!
//! # Responsibilities
//! - Add `cache-control` to successful GET/HEAD responses
//! - Derive an `etag` from the body of buffered GET responses
//! - Answer matching conditional requests with `304 Not Modified`
//!
//! # Design Decisions
//! - Every `200` GET response is held, streamed ones included, so the tag
//!   always covers the full body
//! - Headers set by the handler win over the ones added here
//! - HEAD responses carry no body to hash; they get `cache-control` and a
//!   304 only when the handler supplied its own `etag` or `last-modified`

use axum::http::{Method, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::http::conditional::{is_not_modified, not_modified_headers};
use crate::middleware::outbound::{BufferingOutbound, HeaderTap};
use crate::middleware::{MiddlewareFactory, MiddlewareKind};
use crate::protocol::{
    App, ConnectionContext, ConnectionKind, HeaderList, Inbound, Outbound, OutboundMessage,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    /// Seconds for `max-age`.
    pub max_age: u64,
    /// Emit `private` instead of `public`.
    pub private: bool,
    /// Compute entity tags for GET responses.
    pub etag: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_age: 60,
            private: false,
            etag: true,
        }
    }
}

/// Strong entity tag over the first 128 bits of the body's SHA-256.
pub fn body_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", hex::encode(&digest[..16]))
}

fn cacheable(status: StatusCode, _headers: &HeaderList) -> bool {
    status == StatusCode::OK
}

pub struct CacheMiddleware {
    inner: Box<dyn App>,
    options: CacheOptions,
    cache_control: String,
}

impl CacheMiddleware {
    pub fn new(inner: Box<dyn App>, options: CacheOptions) -> Self {
        let visibility = if options.private { "private" } else { "public" };
        let cache_control = format!("{visibility}, max-age={}", options.max_age);
        Self {
            inner,
            options,
            cache_control,
        }
    }

    async fn handle_get(
        &self,
        ctx: ConnectionContext,
        inbound: &mut dyn Inbound,
        outbound: &mut dyn Outbound,
    ) -> Result<()> {
        let request_headers = ctx.headers.clone();
        let path = ctx.path.clone();
        let mut buffer = BufferingOutbound::new(outbound, cacheable);
        self.inner.call(ctx, inbound, &mut buffer).await?;

        let Some(mut held) = buffer.take()? else {
            return Ok(());
        };
        held.headers.set_default("cache-control", self.cache_control.clone());
        if self.options.etag && !held.headers.contains("etag") {
            held.headers.set("etag", body_etag(&held.body));
        }

        if !is_not_modified(&request_headers, &held.headers) {
            return held.send(buffer.inner()).await;
        }

        tracing::debug!(path = %path, "Conditional request matched; sending 304");
        let outbound = buffer.inner();
        outbound
            .send(OutboundMessage::ResponseStart {
                status: StatusCode::NOT_MODIFIED,
                headers: not_modified_headers(&held.headers),
            })
            .await?;
        outbound
            .send(OutboundMessage::ResponseBody {
                body: Bytes::new(),
                more_body: false,
            })
            .await
    }
}

impl App for CacheMiddleware {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        if ctx.kind != ConnectionKind::Http {
            return self.inner.call(ctx, inbound, outbound);
        }

        match ctx.method {
            Method::GET => Box::pin(self.handle_get(ctx, inbound, outbound)),
            Method::HEAD => Box::pin(async move {
                let request_headers = ctx.headers.clone();
                let mut tap = HeaderTap::new(outbound, |status: &mut StatusCode, headers: &mut HeaderList| {
                    if *status != StatusCode::OK {
                        return;
                    }
                    headers.set_default("cache-control", self.cache_control.clone());
                    if is_not_modified(&request_headers, headers) {
                        *status = StatusCode::NOT_MODIFIED;
                        *headers = not_modified_headers(headers);
                    }
                });
                self.inner.call(ctx, inbound, &mut tap).await
            }),
            _ => self.inner.call(ctx, inbound, outbound),
        }
    }
}

pub(crate) fn factory() -> MiddlewareFactory {
    MiddlewareFactory::new(MiddlewareKind::Buffering, |inner, ctx| {
        Ok(Box::new(CacheMiddleware::new(inner, ctx.options()?)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use crate::protocol::channel::{RecordedResponse, RecordingOutbound, ScriptedInbound};
    use futures_util::stream::{self, StreamExt};

    /// Serves a fixed body, optionally streamed or with its own validators.
    struct Page {
        streamed: bool,
        cache_control: Option<&'static str>,
        etag: Option<&'static str>,
    }

    impl App for Page {
        fn call<'a>(
            &'a self,
            ctx: ConnectionContext,
            _inbound: &'a mut dyn Inbound,
            outbound: &'a mut dyn Outbound,
        ) -> BoxFuture<'a, Result<()>> {
            let mut headers = HeaderList::new();
            if let Some(value) = self.cache_control {
                headers.set("cache-control", value);
            }
            if let Some(value) = self.etag {
                headers.set("etag", value);
            }
            let response = if self.streamed {
                let chunks = stream::iter(vec![Ok(Bytes::from_static(b"page body"))]).boxed();
                Response::stream(StatusCode::OK, chunks, Some("text/plain"), headers)
            } else {
                Response::full(StatusCode::OK, "page body", Some("text/plain"), headers)
            };
            Box::pin(response.send(outbound, ctx.is_head()))
        }
    }

    async fn call(page: Page, ctx: ConnectionContext) -> RecordedResponse {
        let app = CacheMiddleware::new(Box::new(page), CacheOptions::default());
        let mut inbound = ScriptedInbound::request("");
        let mut outbound = RecordingOutbound::new();
        app.call(ctx, &mut inbound, &mut outbound).await.unwrap();
        outbound.response().unwrap()
    }

    fn page() -> Page {
        Page {
            streamed: false,
            cache_control: None,
            etag: None,
        }
    }

    #[tokio::test]
    async fn get_gets_etag_and_cache_control() {
        let response = call(page(), ConnectionContext::http(Method::GET, "/")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("cache-control"), Some("public, max-age=60"));
        assert_eq!(response.headers.get("etag"), Some(body_etag(b"page body").as_str()));
        assert_eq!(response.body, Bytes::from_static(b"page body"));
    }

    #[tokio::test]
    async fn matching_if_none_match_yields_304() {
        let etag = body_etag(b"page body");
        let ctx = ConnectionContext::http(Method::GET, "/").with_header("if-none-match", etag.clone());
        let response = call(page(), ctx).await;
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);
        assert!(response.body.is_empty());
        assert_eq!(response.headers.get("etag"), Some(etag.as_str()));
        assert!(!response.headers.contains("content-length"));
        assert!(!response.headers.contains("content-type"));
    }

    #[tokio::test]
    async fn handler_cache_control_wins() {
        let response = call(
            Page {
                cache_control: Some("no-store"),
                ..page()
            },
            ConnectionContext::http(Method::GET, "/"),
        )
        .await;
        assert_eq!(response.headers.get("cache-control"), Some("no-store"));
    }

    #[tokio::test]
    async fn streamed_get_is_buffered_and_tagged() {
        let streamed = || Page {
            streamed: true,
            ..page()
        };
        let response = call(streamed(), ConnectionContext::http(Method::GET, "/")).await;
        let etag = body_etag(b"page body");
        assert_eq!(response.headers.get("etag"), Some(etag.as_str()));
        assert_eq!(response.headers.get("content-length"), Some("9"));
        assert_eq!(response.body, Bytes::from_static(b"page body"));
        assert_eq!(response.chunks, 1);

        let ctx = ConnectionContext::http(Method::GET, "/").with_header("if-none-match", etag);
        let revalidated = call(streamed(), ctx).await;
        assert_eq!(revalidated.status, StatusCode::NOT_MODIFIED);
        assert!(revalidated.body.is_empty());
    }

    #[tokio::test]
    async fn head_with_handler_etag_can_be_not_modified() {
        let tagged = || Page {
            etag: Some("\"v7\""),
            ..page()
        };
        let ctx = ConnectionContext::http(Method::HEAD, "/").with_header("if-none-match", "\"v7\"");
        let response = call(tagged(), ctx).await;
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers.get("etag"), Some("\"v7\""));
        assert!(!response.headers.contains("content-length"));
        assert!(response.body.is_empty());

        let ctx = ConnectionContext::http(Method::HEAD, "/").with_header("if-none-match", "\"v6\"");
        let stale = call(tagged(), ctx).await;
        assert_eq!(stale.status, StatusCode::OK);
        assert_eq!(stale.headers.get("content-length"), Some("9"));
    }

    #[tokio::test]
    async fn other_methods_pass_through() {
        let post = call(page(), ConnectionContext::http(Method::POST, "/")).await;
        assert!(!post.headers.contains("cache-control"));

        let head = call(page(), ConnectionContext::http(Method::HEAD, "/")).await;
        assert_eq!(head.headers.get("cache-control"), Some("public, max-age=60"));
        assert!(!head.headers.contains("etag"));
        assert!(head.body.is_empty());
    }
}
