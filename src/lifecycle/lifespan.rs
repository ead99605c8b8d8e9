//! Startup/shutdown protocol.
//!
//! # Responsibilities
//! - Run registered startup and shutdown hooks in registration order
//! - Answer `startup` with `startup-complete` or `startup-failed`
//! - Always answer `shutdown` with `shutdown-complete`
//! - Drive the protocol from the transport side (`LifespanClient`)
//!
//! # Data Flow
//! ```text
//! transport                      engine
//!   startup     ───────────────▶ run startup hooks
//!               ◀─────────────── startup-complete | startup-failed
//!   ... serve ...
//!   shutdown    ───────────────▶ run shutdown hooks (errors logged)
//!               ◀─────────────── shutdown-complete
//! ```
//!
//! # Design Decisions
//! - The first failing startup hook stops the rest
//! - Shutdown hook failures never change the reply

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};
use crate::protocol::{
    connection_channels, App, ConnectionContext, ConnectionKind, Inbound, InboundMessage, Outbound,
    OutboundMessage, Peer,
};

/// Error a hook may return.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

type HookFn = dyn Fn() -> BoxFuture<'static, std::result::Result<(), HookError>> + Send + Sync;

#[derive(Clone)]
struct Hook {
    name: String,
    run: Arc<HookFn>,
}

impl Hook {
    fn new<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HookError>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            run: Arc::new(move || -> BoxFuture<'static, std::result::Result<(), HookError>> {
                Box::pin(f())
            }),
        }
    }
}

/// Hooks run around serving.
#[derive(Clone, Default)]
pub struct LifespanHooks {
    startup: Vec<Hook>,
    shutdown: Vec<Hook>,
}

impl LifespanHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_startup<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HookError>> + Send + 'static,
    {
        self.startup.push(Hook::new(name, f));
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HookError>> + Send + 'static,
    {
        self.shutdown.push(Hook::new(name, f));
        self
    }

    /// Run startup hooks; the message describes the first failure.
    async fn run_startup(&self, timeout: Duration) -> std::result::Result<(), String> {
        for hook in &self.startup {
            match tokio::time::timeout(timeout, (hook.run)()).await {
                Ok(Ok(())) => tracing::debug!(hook = %hook.name, "Startup hook finished"),
                Ok(Err(err)) => return Err(format!("startup hook `{}` failed: {err}", hook.name)),
                Err(_) => {
                    return Err(format!(
                        "startup hook `{}` timed out after {}s",
                        hook.name,
                        timeout.as_secs()
                    ))
                }
            }
        }
        Ok(())
    }

    async fn run_shutdown(&self) {
        for hook in &self.shutdown {
            if let Err(err) = (hook.run)().await {
                tracing::error!(hook = %hook.name, error = %err, "Shutdown hook failed");
            }
        }
    }
}

impl std::fmt::Debug for LifespanHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |hooks: &[Hook]| hooks.iter().map(|h| h.name.clone()).collect::<Vec<_>>();
        f.debug_struct("LifespanHooks")
            .field("startup", &names(&self.startup))
            .field("shutdown", &names(&self.shutdown))
            .finish()
    }
}

/// Engine side of a lifespan connection.
///
/// The only valid sequence is one `startup` followed by one `shutdown`.
pub async fn serve_lifespan(
    hooks: &LifespanHooks,
    startup_timeout: Duration,
    inbound: &mut dyn Inbound,
    outbound: &mut dyn Outbound,
) -> Result<()> {
    match inbound.receive().await? {
        InboundMessage::Startup => match hooks.run_startup(startup_timeout).await {
            Ok(()) => {
                tracing::info!("Startup complete");
                outbound.send(OutboundMessage::StartupComplete).await?;
            }
            Err(message) => {
                tracing::error!(error = %message, "Startup failed");
                outbound.send(OutboundMessage::StartupFailed { message }).await?;
            }
        },
        other => return Err(out_of_phase(&other, "startup")),
    }

    match inbound.receive().await? {
        InboundMessage::Shutdown => {
            hooks.run_shutdown().await;
            tracing::info!("Shutdown hooks finished");
            outbound.send(OutboundMessage::ShutdownComplete).await
        }
        other => Err(out_of_phase(&other, "shutdown")),
    }
}

fn out_of_phase(message: &InboundMessage, expected: &str) -> EngineError {
    EngineError::protocol(format!(
        "unexpected {} on a lifespan connection, expected {expected}",
        message.name()
    ))
}

/// Transport-side failures of the lifespan protocol.
#[derive(Debug, Error)]
pub enum LifespanError {
    #[error("startup failed: {0}")]
    StartupFailed(String),

    #[error("lifespan connection closed before replying to {0}")]
    Closed(&'static str),
}

/// Transport side of the lifespan connection.
pub struct LifespanClient {
    peer: Peer,
    task: JoinHandle<Result<()>>,
}

impl LifespanClient {
    /// Open the lifespan connection against `app`.
    pub fn spawn<A: App + 'static>(app: Arc<A>) -> Self {
        let (peer, mut inbound, mut outbound) = connection_channels(ConnectionKind::Lifespan, 4);
        let task = tokio::spawn(async move {
            app.call(ConnectionContext::lifespan(), &mut inbound, &mut outbound)
                .await
        });
        Self { peer, task }
    }

    pub async fn startup(&mut self) -> std::result::Result<(), LifespanError> {
        if !self.peer.send(InboundMessage::Startup).await {
            return Err(LifespanError::Closed("startup"));
        }
        match self.peer.recv().await {
            Some(OutboundMessage::StartupComplete) => Ok(()),
            Some(OutboundMessage::StartupFailed { message }) => Err(LifespanError::StartupFailed(message)),
            _ => Err(LifespanError::Closed("startup")),
        }
    }

    /// Send `shutdown` and wait for the reply and the connection task.
    pub async fn shutdown(mut self) -> std::result::Result<(), LifespanError> {
        if !self.peer.send(InboundMessage::Shutdown).await {
            return Err(LifespanError::Closed("shutdown"));
        }
        let replied = matches!(self.peer.recv().await, Some(OutboundMessage::ShutdownComplete));
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "Lifespan connection failed"),
            Err(err) => tracing::error!(error = %err, "Lifespan task panicked"),
        }
        if replied {
            Ok(())
        } else {
            Err(LifespanError::Closed("shutdown"))
        }
    }
}
