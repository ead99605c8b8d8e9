//! axum transport adapter.
//!
//! # Responsibilities
//! - Accept HTTP/1.1 and HTTP/2 connections via axum
//! - Translate each request or upgrade into a `ConnectionContext` plus a
//!   channel pair and run the engine on its own task
//! - Stream request bodies in and response bodies out
//! - Run the lifespan protocol around serving
//! - Apply reloaded configuration and drain on shutdown
//!
//! # Data Flow
//! ```text
//! axum request
//!     → context (method, path, query, headers, peer address)
//!     → Peer.tx: http.request chunks | websocket.connect + frames
//!     → Engine::call on a spawned task
//!     → Peer.rx: response start + body chunks | accept + frames + close
//!     → axum response / socket
//! ```
//!
//! # Design Decisions
//! - The engine never sees axum types; everything crosses the channel pair
//! - Paths reach the engine as sent on the request line, still
//!   percent-encoded
//! - An application that fails before starting a response is answered with
//!   the same translation the `errors` interceptor uses
//! - Closing a stream before accepting it becomes a 403

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body as AxumBody;
use axum::extract::ws::{CloseFrame, Message, WebSocket as AxumSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Router;
use bytes::Bytes;
use futures_util::{stream, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::{EngineConfig, ListenerConfig};
use crate::engine::Engine;
use crate::error::{EngineError, ABNORMAL_CLOSURE};
use crate::http::response::{Body, Response};
use crate::http::websocket::NORMAL_CLOSURE;
use crate::lifecycle::{LifespanClient, LifespanError};
use crate::middleware::errors::error_response;
use crate::net::{ConnectionId, ConnectionTracker};
use crate::observability::metrics;
use crate::protocol::{
    connection_channels, App, ConnectionContext, ConnectionKind, Frame, HeaderList, InboundMessage,
    OutboundMessage, Peer,
};

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Lifespan(#[from] LifespanError),

    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
struct ServerState {
    engine: Arc<Engine>,
    connections: ConnectionTracker,
    max_connections: u64,
    channel_capacity: usize,
    local_addr: Option<SocketAddr>,
}

/// Serves an [`Engine`] over TCP.
pub struct HttpServer {
    engine: Arc<Engine>,
    listener: ListenerConfig,
    lifespan: bool,
    connections: ConnectionTracker,
}

impl HttpServer {
    pub fn new(engine: Arc<Engine>, config: &EngineConfig) -> Self {
        Self {
            engine,
            listener: config.listener.clone(),
            lifespan: config.lifespan.enabled,
            connections: ConnectionTracker::new(),
        }
    }

    /// Router without a known local address, for in-process use.
    pub fn router(&self) -> Router {
        self.build_router(None)
    }

    fn build_router(&self, local_addr: Option<SocketAddr>) -> Router {
        let state = ServerState {
            engine: Arc::clone(&self.engine),
            connections: self.connections.clone(),
            max_connections: self.listener.max_connections as u64,
            channel_capacity: self.listener.channel_capacity.max(1),
            local_addr,
        };
        Router::new()
            .fallback(handle)
            .layer(RequestBodyLimitLayer::new(self.listener.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` fires, then drain and run shutdown hooks.
    ///
    /// Configs arriving on `config_updates` are applied with
    /// [`Engine::reload`]; a config that fails to build is logged and
    /// skipped.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<EngineConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;

        let lifespan = if self.lifespan {
            let mut client = LifespanClient::spawn(Arc::clone(&self.engine));
            client.startup().await?;
            Some(client)
        } else {
            None
        };

        let engine = Arc::clone(&self.engine);
        let reloader = tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                match engine.reload(&config) {
                    Ok(()) => tracing::info!("Configuration reloaded"),
                    Err(err) => tracing::error!(error = %err, "Reload rejected; keeping current pipeline"),
                }
            }
        });

        let app = self.build_router(Some(local_addr));
        tracing::info!(address = %local_addr, "Listening for connections");

        let mut drain_signal = shutdown.resubscribe();
        let mut serving = tokio::spawn(
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .into_future(),
        );

        let drain = Duration::from_secs(self.listener.drain_timeout_secs);
        let served = tokio::select! {
            result = &mut serving => result,
            _ = drain_signal.recv() => {
                let deadline = tokio::time::Instant::now() + drain;
                tracing::info!(
                    open = self.connections.active_count(),
                    timeout_secs = drain.as_secs(),
                    "Draining connections"
                );
                let result = match tokio::time::timeout_at(deadline, &mut serving).await {
                    Ok(result) => result,
                    Err(_) => {
                        serving.abort();
                        Ok(Ok(()))
                    }
                };
                // Upgraded streams outlive the HTTP connection they came from.
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if !self.connections.drain(remaining).await {
                    tracing::warn!(
                        open = self.connections.active_count(),
                        "Drain deadline passed; abandoning remaining connections"
                    );
                }
                result
            }
        };
        reloader.abort();

        if let Some(client) = lifespan {
            if let Err(err) = client.shutdown().await {
                tracing::error!(error = %err, "Lifespan shutdown failed");
            }
        }

        served??;
        tracing::info!("Server stopped");
        Ok(())
    }
}

/// 503 when the connection cap is already reached.
fn reject_when_full(connections: &ConnectionTracker, max_connections: u64) -> Option<AxumResponse> {
    if connections.active_count() < max_connections {
        return None;
    }
    metrics::record_connection_rejected();
    Some((StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response())
}

async fn handle(State(state): State<ServerState>, request: Request) -> AxumResponse {
    if let Some(rejected) = reject_when_full(&state.connections, state.max_connections) {
        return rejected;
    }

    let (mut parts, body) = request.into_parts();
    let is_upgrade = parts
        .headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    let kind = if is_upgrade {
        ConnectionKind::WebSocket
    } else {
        ConnectionKind::Http
    };
    let client = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ctx = context(kind, &parts, client, state.local_addr);

    if is_upgrade {
        match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => serve_websocket(state, ctx, upgrade).await,
            Err(rejection) => rejection.into_response(),
        }
    } else {
        serve_http(state, ctx, body).await
    }
}

/// Build the engine's view of a request.
fn context(
    kind: ConnectionKind,
    parts: &axum::http::request::Parts,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
) -> ConnectionContext {
    let path = parts.uri.path();
    let mut ctx = match kind {
        ConnectionKind::WebSocket => ConnectionContext::websocket(path),
        _ => ConnectionContext::http(parts.method.clone(), path),
    }
    .with_query(Bytes::copy_from_slice(parts.uri.query().unwrap_or("").as_bytes()));
    ctx.client = client;
    ctx.server = server;
    if parts.uri.scheme_str() == Some("https") {
        ctx.scheme = if kind == ConnectionKind::WebSocket { "wss" } else { "https" }.to_string();
    }
    for (name, value) in &parts.headers {
        ctx.headers
            .append(name.as_str(), Bytes::copy_from_slice(value.as_bytes()));
    }
    ctx
}

/// Convert the engine's headers, skipping pairs axum cannot represent.
fn apply_headers(target: &mut axum::http::HeaderMap, headers: &HeaderList) {
    for (name, value) in headers.iter() {
        match (HeaderName::from_bytes(name), HeaderValue::from_bytes(value)) {
            (Ok(name), Ok(value)) => {
                target.append(name, value);
            }
            _ => tracing::warn!(
                header = %String::from_utf8_lossy(name),
                "Dropping header that is not valid HTTP"
            ),
        }
    }
}

/// Answer without the engine, for failures before any response started.
fn fallback(response: Response) -> AxumResponse {
    let body = match response.body() {
        Body::Full(bytes) => bytes.clone(),
        _ => Bytes::new(),
    };
    let mut out = AxumResponse::new(AxumBody::from(body));
    *out.status_mut() = response.status();
    apply_headers(out.headers_mut(), response.headers());
    out
}

fn log_outcome(connection: ConnectionId, result: Result<crate::error::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_disconnect() => {
            tracing::debug!(connection_id = %connection, "Client disconnected")
        }
        Ok(Err(err)) => tracing::error!(connection_id = %connection, error = %err, "Connection failed"),
        Err(err) => tracing::error!(connection_id = %connection, error = %err, "Connection task panicked"),
    }
}

async fn serve_http(state: ServerState, ctx: ConnectionContext, body: AxumBody) -> AxumResponse {
    let started = Instant::now();
    let method = ctx.method.clone();
    let connection = ctx.id;
    let (peer, mut inbound, mut outbound) = connection_channels(ConnectionKind::Http, state.channel_capacity);
    let Peer { tx, mut rx } = peer;

    let guard = state.connections.track(connection);
    let engine = Arc::clone(&state.engine);
    let app = tokio::spawn(async move {
        let _guard = guard;
        engine.call(ctx, &mut inbound, &mut outbound).await
    });

    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            let message = match chunk {
                Ok(body) => InboundMessage::Body { body, more_body: true },
                Err(err) => {
                    tracing::debug!(error = %err, "Request body aborted");
                    let _ = tx.send(InboundMessage::HttpDisconnect).await;
                    return;
                }
            };
            if tx.send(message).await.is_err() {
                return;
            }
        }
        let _ = tx
            .send(InboundMessage::Body {
                body: Bytes::new(),
                more_body: false,
            })
            .await;
    });

    let (status, headers) = match rx.recv().await {
        Some(OutboundMessage::ResponseStart { status, headers }) => (status, headers),
        Some(other) => {
            tracing::error!(message = other.name(), "Response did not begin with a start message");
            app.abort();
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
        None => {
            let err = match app.await {
                Ok(Err(err)) => err,
                Ok(Ok(())) => EngineError::protocol("application returned without a response"),
                Err(join) => EngineError::handler(join),
            };
            if !err.is_disconnect() {
                tracing::error!(connection_id = %connection, error = %err, "Request failed before responding");
            }
            let response = fallback(error_response(&err, state.engine.debug()));
            metrics::record_request(method.as_str(), response.status().as_u16(), started);
            return response;
        }
    };
    metrics::record_request(method.as_str(), status.as_u16(), started);
    tokio::spawn(async move { log_outcome(connection, app.await) });

    let chunks = stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        match rx.recv().await {
            Some(OutboundMessage::ResponseBody { body, more_body }) => {
                Some((Ok::<_, std::io::Error>(body), more_body.then_some(rx)))
            }
            Some(other) => Some((
                Err(std::io::Error::other(format!("unexpected {} in response body", other.name()))),
                None,
            )),
            None => None,
        }
    });

    let mut response = AxumResponse::new(AxumBody::from_stream(chunks));
    *response.status_mut() = status;
    apply_headers(response.headers_mut(), &headers);
    response
}

async fn serve_websocket(state: ServerState, ctx: ConnectionContext, upgrade: WebSocketUpgrade) -> AxumResponse {
    let connection = ctx.id;
    let (peer, mut inbound, mut outbound) =
        connection_channels(ConnectionKind::WebSocket, state.channel_capacity);
    let Peer { tx, mut rx } = peer;

    let guard = state.connections.track(connection);
    let engine = Arc::clone(&state.engine);
    let app = tokio::spawn(async move {
        let _guard = guard;
        engine.call(ctx, &mut inbound, &mut outbound).await
    });

    if tx.send(InboundMessage::Connect).await.is_err() {
        log_outcome(connection, app.await);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
    }

    match rx.recv().await {
        Some(OutboundMessage::Accept { subprotocol, headers }) => {
            tokio::spawn(async move { log_outcome(connection, app.await) });
            let upgrade = match subprotocol {
                Some(protocol) => upgrade.protocols([protocol]),
                None => upgrade,
            };
            let mut response = upgrade.on_upgrade(move |socket| bridge(socket, tx, rx));
            apply_headers(response.headers_mut(), &headers);
            response
        }
        Some(OutboundMessage::Close { code, .. }) => {
            tracing::debug!(connection_id = %connection, code, "Stream closed before accept");
            tokio::spawn(async move { log_outcome(connection, app.await) });
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
        Some(other) => {
            tracing::error!(message = other.name(), "Stream did not begin with accept or close");
            app.abort();
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
        None => {
            log_outcome(connection, app.await);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

/// Pump frames between an upgraded socket and the engine.
async fn bridge(socket: AxumSocket, tx: mpsc::Sender<InboundMessage>, mut rx: mpsc::Receiver<OutboundMessage>) {
    let (mut sink, mut frames) = socket.split();

    let incoming = async move {
        while let Some(message) = frames.next().await {
            let message = match message {
                Ok(Message::Text(text)) => InboundMessage::Frame(Frame::Text(text.as_str().to_string())),
                Ok(Message::Binary(data)) => InboundMessage::Frame(Frame::Binary(data)),
                Ok(Message::Close(frame)) => InboundMessage::Disconnect {
                    code: frame.map(|f| f.code).unwrap_or(NORMAL_CLOSURE),
                },
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "Socket read failed");
                    InboundMessage::Disconnect {
                        code: ABNORMAL_CLOSURE,
                    }
                }
            };
            let last = matches!(message, InboundMessage::Disconnect { .. });
            if tx.send(message).await.is_err() || last {
                return;
            }
        }
        let _ = tx
            .send(InboundMessage::Disconnect {
                code: ABNORMAL_CLOSURE,
            })
            .await;
    };

    let outgoing = async move {
        while let Some(message) = rx.recv().await {
            let frame = match message {
                OutboundMessage::Send(Frame::Text(text)) => Message::Text(text.into()),
                OutboundMessage::Send(Frame::Binary(data)) => Message::Binary(data),
                OutboundMessage::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    return;
                }
                other => {
                    tracing::warn!(message = other.name(), "Unexpected message on an open stream");
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                return;
            }
        }
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: NORMAL_CLOSURE,
                reason: String::new().into(),
            })))
            .await;
    };

    tokio::pin!(incoming);
    tokio::pin!(outgoing);
    tokio::select! {
        _ = &mut outgoing => {}
        _ = &mut incoming => {
            // Let the application finish its side after the peer left.
            let _ = tokio::time::timeout(Duration::from_secs(5), outgoing).await;
        }
    }
}
