//! `errors`: translate every failure raised by inner stages into a response.
//!
//! Declared first, this is the outermost stage, so nothing escapes it
//! except on connections where a response had already started.

use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::dispatch::failure_status;
use crate::error::{EngineError, Result};
use crate::http::Response;
use crate::middleware::{MiddlewareFactory, MiddlewareKind};
use crate::protocol::{
    App, ConnectionContext, ConnectionKind, HeaderList, Inbound, Outbound, OutboundMessage,
    ResponseGuard,
};

/// Build the response for an error.
///
/// With `debug`, unhandled errors carry the full error chain as plain text.
pub fn error_response(err: &EngineError, debug: bool) -> Response {
    match err {
        EngineError::Redirect { status, location } => Response::redirect(location, *status),
        EngineError::Application {
            status,
            detail,
            headers,
        } => Response::detail(*status, detail, headers.clone()),
        EngineError::Resolution(failure) => {
            let status = failure_status(failure);
            Response::detail(status, status.canonical_reason().unwrap_or("error"), HeaderList::new())
        }
        EngineError::Overloaded { .. } => Response::detail(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
            HeaderList::new(),
        ),
        _ if debug => Response::full(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.trace(),
            Some("text/plain"),
            HeaderList::new(),
        ),
        _ => Response::full(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            Some("text/plain"),
            HeaderList::new(),
        ),
    }
}

/// Outermost error translation stage.
pub struct ErrorsMiddleware {
    inner: Box<dyn App>,
    debug: bool,
}

impl ErrorsMiddleware {
    pub fn new(inner: Box<dyn App>, debug: bool) -> Self {
        Self { inner, debug }
    }

    async fn handle_http(
        &self,
        ctx: ConnectionContext,
        inbound: &mut dyn Inbound,
        outbound: &mut dyn Outbound,
    ) -> Result<()> {
        let head_only = ctx.is_head();
        let path = ctx.path.clone();
        let mut guard = ResponseGuard::new(outbound);

        let err = match self.inner.call(ctx, inbound, &mut guard).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_disconnect() => {
                tracing::debug!(path = %path, "Client disconnected mid-request");
                return Ok(());
            }
            Err(err) => err,
        };

        let response = error_response(&err, self.debug);
        if response.status().is_server_error() {
            tracing::error!(path = %path, error = %err, "Request failed");
        } else {
            tracing::debug!(path = %path, status = response.status().as_u16(), error = %err, "Request ended with an error response");
        }

        if guard.started() {
            // Too late for a new status; close the body that is in flight.
            tracing::warn!(path = %path, "Error after response start; terminating body");
            if !guard.is_complete() {
                guard
                    .send(OutboundMessage::ResponseBody {
                        body: Bytes::new(),
                        more_body: false,
                    })
                    .await?;
            }
            return Ok(());
        }

        match response.send(&mut guard, head_only).await {
            Err(err) if err.is_disconnect() => Ok(()),
            other => other,
        }
    }
}

impl App for ErrorsMiddleware {
    fn call<'a>(
        &'a self,
        ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match ctx.kind {
                ConnectionKind::Http => self.handle_http(ctx, inbound, outbound).await,
                _ => self.inner.call(ctx, inbound, outbound).await,
            }
        })
    }
}

pub(crate) fn factory() -> MiddlewareFactory {
    MiddlewareFactory::new(MiddlewareKind::PassThrough, |inner, ctx| {
        Ok(Box::new(ErrorsMiddleware::new(inner, ctx.debug)))
    })
}
