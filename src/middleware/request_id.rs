//! `request_id`: correlation IDs.
//!
//! Reuses a well-formed incoming `x-request-id` or generates a UUID v4,
//! makes it visible to inner stages through the context, echoes it on the
//! response, and runs the inner stages inside a span carrying it.

use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::http::{CorrelationId, X_REQUEST_ID};
use crate::middleware::outbound::HeaderTap;
use crate::middleware::{MiddlewareFactory, MiddlewareKind};
use crate::protocol::{App, ConnectionContext, ConnectionKind, HeaderList, Inbound, Outbound};

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RequestIdOptions {
    /// Accept IDs supplied by the client.
    trust_incoming: bool,
}

impl Default for RequestIdOptions {
    fn default() -> Self {
        Self {
            trust_incoming: true,
        }
    }
}

fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic())
}

pub struct RequestIdMiddleware {
    inner: Box<dyn App>,
    trust_incoming: bool,
}

impl RequestIdMiddleware {
    pub fn new(inner: Box<dyn App>) -> Self {
        Self {
            inner,
            trust_incoming: true,
        }
    }

    fn resolve_id(&self, ctx: &ConnectionContext) -> String {
        ctx.header(X_REQUEST_ID)
            .filter(|id| self.trust_incoming && is_valid_id(id))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

impl App for RequestIdMiddleware {
    fn call<'a>(
        &'a self,
        mut ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        if ctx.kind == ConnectionKind::Lifespan {
            return self.inner.call(ctx, inbound, outbound);
        }

        let id = self.resolve_id(&ctx);
        ctx.headers.set(X_REQUEST_ID, id.clone());
        ctx.extensions.insert(CorrelationId(id.clone()));
        let span = tracing::info_span!("request", request_id = %id, connection = %ctx.id);

        Box::pin(
            async move {
                let mut tap = HeaderTap::new(outbound, |_: &mut StatusCode, headers: &mut HeaderList| {
                    headers.set(X_REQUEST_ID, id.clone());
                });
                self.inner.call(ctx, inbound, &mut tap).await
            }
            .instrument(span),
        )
    }
}

pub(crate) fn factory() -> MiddlewareFactory {
    MiddlewareFactory::new(MiddlewareKind::PassThrough, |inner, ctx| {
        let options: RequestIdOptions = ctx.options()?;
        Ok(Box::new(RequestIdMiddleware {
            inner,
            trust_incoming: options.trust_incoming,
        }))
    })
}
