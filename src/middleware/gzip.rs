//! `gzip`: response compression.
//!
//! # Responsibilities
//! - Compress buffered responses for clients that accept gzip
//! - Offload compression to the worker pool when one is configured
//!
//! # Design Decisions
//! - Every response with a compressible media type is held, streamed ones
//!   included; `minimum_size` is checked once the whole body is in hand
//! - A compressed body that is not smaller than the original is discarded
//! - A saturated worker pool degrades to an uncompressed response, never
//!   to a 503

use std::io::Write;
use std::sync::Arc;

use axum::http::{Method, StatusCode};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::error::{EngineError, Result};
use crate::middleware::outbound::BufferingOutbound;
use crate::middleware::{MiddlewareFactory, MiddlewareKind};
use crate::observability::metrics;
use crate::protocol::{App, ConnectionContext, ConnectionKind, HeaderList, Inbound, Outbound};
use crate::workers::WorkerPool;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GzipOptions {
    /// Smallest body worth compressing, in bytes.
    pub minimum_size: usize,
    /// zlib level, 1 (fast) to 9 (small).
    pub compresslevel: u32,
}

impl Default for GzipOptions {
    fn default() -> Self {
        Self {
            minimum_size: 500,
            compresslevel: 6,
        }
    }
}

/// True when an `accept-encoding` value admits gzip.
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding.split(',').any(|entry| {
        let mut parts = entry.split(';');
        let coding = parts.next().unwrap_or("").trim();
        if !coding.eq_ignore_ascii_case("gzip") && coding != "*" {
            return false;
        }
        let q = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        q > 0.0
    })
}

fn is_compressible(content_type: &str) -> bool {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    media.starts_with("text/")
        || media.ends_with("+json")
        || media.ends_with("+xml")
        || matches!(
            media.as_str(),
            "application/json" | "application/javascript" | "application/xml" | "image/svg+xml"
        )
}

fn selects(status: StatusCode, headers: &HeaderList) -> bool {
    if status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || headers.contains("content-encoding")
    {
        return false;
    }
    headers.get("content-type").is_some_and(is_compressible)
}

fn compress(body: &[u8], level: u32) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::new(level));
    encoder.write_all(body)?;
    Ok(Bytes::from(encoder.finish()?))
}

pub struct GzipMiddleware {
    inner: Box<dyn App>,
    options: GzipOptions,
    workers: Option<Arc<dyn WorkerPool>>,
}

impl GzipMiddleware {
    pub fn new(inner: Box<dyn App>, options: GzipOptions, workers: Option<Arc<dyn WorkerPool>>) -> Self {
        Self {
            inner,
            options,
            workers,
        }
    }


    /// Compress on the pool when present. `None` means "send uncompressed".
    async fn compress_body(&self, body: Bytes) -> Result<Option<Bytes>> {
        let level = self.options.compresslevel;
        let Some(pool) = &self.workers else {
            return compress(&body, level).map(Some);
        };
        match pool.submit(Box::new(move || compress(&body, level))).await {
            Ok(compressed) => Ok(Some(compressed)),
            Err(EngineError::Overloaded { capacity }) => {
                tracing::warn!(capacity, "Worker pool saturated; sending uncompressed");
                metrics::record_compression("overloaded");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn handle(
        &self,
        ctx: ConnectionContext,
        inbound: &mut dyn Inbound,
        outbound: &mut dyn Outbound,
    ) -> Result<()> {
        let mut buffer = BufferingOutbound::new(outbound, selects);
        self.inner.call(ctx, inbound, &mut buffer).await?;

        let Some(mut held) = buffer.take()? else {
            return Ok(());
        };
        let original = held.body.len();
        if original < self.options.minimum_size {
            return held.send(buffer.inner()).await;
        }
        match self.compress_body(held.body.clone()).await? {
            Some(compressed) if compressed.len() < original => {
                tracing::debug!(original, compressed = compressed.len(), "Response compressed");
                metrics::record_compression("compressed");
                held.set_body(compressed);
                held.headers.set("content-encoding", "gzip");
                held.headers.append("vary", "Accept-Encoding");
            }
            Some(_) => metrics::record_compression("not_smaller"),
            None => {}
        }
        held.send(buffer.inner()).await
    }
}

impl App for GzipMiddleware {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        let eligible = ctx.kind == ConnectionKind::Http
            && ctx.method != Method::HEAD
            && ctx.header("accept-encoding").is_some_and(accepts_gzip);
        if !eligible {
            return self.inner.call(ctx, inbound, outbound);
        }
        Box::pin(self.handle(ctx, inbound, outbound))
    }
}

pub(crate) fn factory() -> MiddlewareFactory {
    MiddlewareFactory::new(MiddlewareKind::Buffering, |inner, ctx| {
        let options: GzipOptions = ctx.options()?;
        if !(1..=9).contains(&options.compresslevel) {
            return Err(ConfigError::MiddlewareOptions {
                name: ctx.name.to_string(),
                message: format!("compresslevel must be 1-9, got {}", options.compresslevel),
            });
        }
        Ok(Box::new(GzipMiddleware::new(inner, options, ctx.workers.clone())))
    })
}
