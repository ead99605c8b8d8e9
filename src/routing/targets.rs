//! Handlers for routes declared in configuration.
//!
//! # Responsibilities
//! - Turn `[[routes]]` entries into a `RouteTable`
//! - Serve the built-in targets: text, file, static directory, redirect,
//!   request echo and stream echo
//!
//! # Design Decisions
//! - Static lookups refuse `..` and hidden segments instead of normalizing
//!   them
//! - A missing static file is a `NotFound` resolution failure, so it maps
//!   to 404 like any unknown path

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::http::StatusCode;
use futures_util::future::BoxFuture;

use crate::config::{ConfigError, RouteConfig, RouteTarget, ValidationError};
use crate::dispatch::handler::{Handler, HandlerOutput, StreamHandler};
use crate::error::{EngineError, Result};
use crate::http::{Request, WebSocket};
use crate::protocol::HeaderList;
use crate::routing::router::{ResolveFailure, RouteHandler, RouteMetadata, RouteOptions, RouteTable};

/// HTTP targets.
#[derive(Debug, Clone)]
enum Target {
    Text(String),
    File(PathBuf),
    Static(PathBuf),
    Redirect { location: String, status: StatusCode },
    Echo,
}

/// Resolve `remaining` under `root`, refusing anything that could escape it.
fn static_path(root: &Path, remaining: &[String]) -> Option<PathBuf> {
    if remaining.is_empty() {
        return None;
    }
    let mut path = root.to_path_buf();
    for segment in remaining {
        if segment.starts_with('.') || segment.contains(['/', '\\']) {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

impl Handler for Target {
    fn call(&self, request: Request) -> BoxFuture<'static, Result<HandlerOutput>> {
        let target = self.clone();
        Box::pin(async move {
            match target {
                Target::Text(body) => Ok(HandlerOutput::Text(body)),
                Target::File(path) => Ok(HandlerOutput::File(path)),
                Target::Static(root) => {
                    let path = static_path(&root, request.remaining())
                        .ok_or(EngineError::Resolution(ResolveFailure::NotFound))?;
                    match tokio::fs::metadata(&path).await {
                        Ok(meta) if meta.is_file() => Ok(HandlerOutput::File(path)),
                        _ => Err(EngineError::Resolution(ResolveFailure::NotFound)),
                    }
                }
                Target::Redirect { location, status } => {
                    Ok(HandlerOutput::Redirect { location, status })
                }
                Target::Echo => {
                    let output = HandlerOutput::Bytes(request.body().clone());
                    Ok(match request.header("content-type") {
                        Some(media_type) => output.wrapped(RouteMetadata {
                            mime_type: Some(media_type.to_string()),
                            ..RouteMetadata::default()
                        }),
                        None => output,
                    })
                }
            }
        })
    }
}

/// Echoes text and binary frames until the peer leaves.
#[derive(Debug, Clone, Copy)]
pub struct EchoSocket;

impl StreamHandler for EchoSocket {
    fn call<'a>(&'a self, mut socket: WebSocket<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let offered = socket.subprotocols().first().map(|p| p.to_string());
            socket.accept(offered.as_deref(), HeaderList::new()).await?;
            loop {
                match socket.receive_text().await {
                    Ok(text) => socket.send_text(text).await?,
                    // The binary frame stays pending for receive_bytes.
                    Err(EngineError::FrameType { .. }) => {
                        let data = socket.receive_bytes().await?;
                        socket.send_bytes(data).await?;
                    }
                    Err(EngineError::Disconnect { .. }) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        })
    }
}

fn invalid(field: String, message: String) -> ConfigError {
    ConfigError::Validation(vec![ValidationError { field, message }])
}

impl RouteTable {
    /// Build a table from configured routes, in declaration order.
    pub fn from_config(routes: &[RouteConfig]) -> std::result::Result<Self, ConfigError> {
        let mut table = RouteTable::new();
        for (i, route) in routes.iter().enumerate() {
            let status = route
                .status
                .map(|code| {
                    StatusCode::from_u16(code)
                        .map_err(|err| invalid(format!("routes[{i}].status"), err.to_string()))
                })
                .transpose()?;
            let mut headers = HeaderList::new();
            for (name, value) in &route.headers {
                headers.append(name, value.clone());
            }
            let options = RouteOptions {
                metadata: RouteMetadata {
                    mime_type: route.mime_type.clone(),
                    status,
                    headers,
                    required_tags: route.required_tags.clone(),
                },
                exact: route.exact,
                capability: route.capability.clone(),
            };

            let handler = match &route.target {
                RouteTarget::Text { body } => RouteHandler::Http(Arc::new(Target::Text(body.clone()))),
                RouteTarget::File { path } => RouteHandler::Http(Arc::new(Target::File(path.clone()))),
                RouteTarget::Static { root } => {
                    RouteHandler::Http(Arc::new(Target::Static(root.clone())))
                }
                RouteTarget::Redirect {
                    location,
                    permanent,
                } => RouteHandler::Http(Arc::new(Target::Redirect {
                    location: location.clone(),
                    status: if *permanent {
                        StatusCode::PERMANENT_REDIRECT
                    } else {
                        StatusCode::TEMPORARY_REDIRECT
                    },
                })),
                RouteTarget::Echo => RouteHandler::Http(Arc::new(Target::Echo)),
                RouteTarget::WebsocketEcho => RouteHandler::WebSocket(Arc::new(EchoSocket)),
            };
            table = table.add(&route.path, handler, options);
        }
        tracing::debug!(routes = table.len(), "Route table built");
        Ok(table)
    }
}
