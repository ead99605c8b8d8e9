//! `logging`: one structured access-log event per request.

use std::time::Instant;

use futures_util::future::BoxFuture;

use crate::error::Result;
use crate::http::CorrelationId;
use crate::middleware::{MiddlewareFactory, MiddlewareKind};
use crate::protocol::{App, ConnectionContext, ConnectionKind, Inbound, Outbound, ResponseGuard};

pub struct AccessLog {
    inner: Box<dyn App>,
}

impl AccessLog {
    pub fn new(inner: Box<dyn App>) -> Self {
        Self { inner }
    }
}

impl App for AccessLog {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        if ctx.kind != ConnectionKind::Http {
            return self.inner.call(ctx, inbound, outbound);
        }

        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.method.clone();
            let path = ctx.path.clone();
            let request_id = ctx
                .extensions
                .get::<CorrelationId>()
                .map(|c| c.0.clone())
                .unwrap_or_else(|| "-".to_string());

            let mut guard = ResponseGuard::new(outbound);
            let result = self.inner.call(ctx, inbound, &mut guard).await;
            let status = guard.status().map(|s| s.as_u16()).unwrap_or(0);

            match &result {
                Ok(()) => tracing::info!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    status,
                    bytes = guard.bytes_sent(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Request completed"
                ),
                Err(err) => tracing::info!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    status,
                    bytes = guard.bytes_sent(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %err,
                    "Request failed"
                ),
            }
            result
        })
    }
}

pub(crate) fn factory() -> MiddlewareFactory {
    MiddlewareFactory::new(MiddlewareKind::PassThrough, |inner, _ctx| {
        Ok(Box::new(AccessLog::new(inner)))
    })
}
