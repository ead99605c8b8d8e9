//! switchyard server binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────────────────────────────────────────────────┐
//!                 │                      SWITCHYARD                       │
//!   connection    │  ┌────────────┐    ┌─────────────────────────────┐    │
//!  ───────────────┼─▶│   axum     │───▶│ Engine                      │    │
//!                 │  │  adapter   │    │  lifespan → hooks           │    │
//!                 │  │(http/ws)   │◀───│  http/ws  → pipeline        │    │
//!                 │  └────────────┘    │     errors → cors → auth …  │    │
//!                 │                    │     → Dispatcher → handler  │    │
//!                 │                    └─────────────────────────────┘    │
//!                 │  ┌────────┐ ┌──────────┐ ┌─────────┐ ┌────────────┐   │
//!                 │  │ config │ │ watcher  │ │ metrics │ │ signals    │   │
//!                 │  └────────┘ └──────────┘ └─────────┘ └────────────┘   │
//!                 └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use switchyard::config::{load_config, ConfigWatcher, EngineConfig};
use switchyard::lifecycle::{spawn_signal_handler, Shutdown};
use switchyard::observability::{logging, metrics};
use switchyard::{Engine, HttpServer};

#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about = "Connection-protocol engine")]
struct Args {
    /// TOML configuration file; watched for changes when given.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Include error traces in 500 responses.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.listener.bind_address = bind.clone();
    }
    config.debug |= args.debug;

    logging::init(&config.logging)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "switchyard starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        middleware = config.middleware.len(),
        routes = config.routes.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(err) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %err,
                "Failed to parse metrics address"
            ),
        }
    }

    let engine = Arc::new(Engine::builder(config.clone()).build()?);
    let listener = TcpListener::bind(&config.listener.bind_address).await?;

    // The watcher handle must stay alive for events to keep arriving.
    let (_watcher, updates) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.run()?), updates)
        }
        None => {
            let (_, updates) = mpsc::unbounded_channel();
            (None, updates)
        }
    };

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let server = HttpServer::new(engine, &config);
    server.run(listener, updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
