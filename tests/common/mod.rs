//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use switchyard::config::parse_config;
use switchyard::http::ServerError;
use switchyard::{Engine, EngineBuilder, EngineConfig, HttpServer, Shutdown};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A server bound to an ephemeral port on loopback.
pub struct TestServer {
    pub addr: SocketAddr,
    pub engine: Arc<Engine>,
    pub updates: mpsc::UnboundedSender<EngineConfig>,
    shutdown: Shutdown,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Trigger shutdown and wait for the server to finish.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked")
    }
}

/// Parse `toml_text` with test-friendly listener settings.
pub fn config(toml_text: &str) -> EngineConfig {
    let mut config = parse_config(toml_text).expect("test config should parse");
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.drain_timeout_secs = 2;
    config
}

/// Start a server for `toml_text` with default engine settings.
pub async fn spawn_server(toml_text: &str) -> TestServer {
    let config = config(toml_text);
    spawn_with(Engine::builder(config.clone()), config).await
}

/// Start a server from a customized builder.
pub async fn spawn_with(builder: EngineBuilder, config: EngineConfig) -> TestServer {
    let engine = Arc::new(builder.build().expect("engine should build"));
    let listener = TcpListener::bind(&config.listener.bind_address)
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");

    let (updates, rx) = mpsc::unbounded_channel();
    let shutdown = Shutdown::new();
    let server = HttpServer::new(Arc::clone(&engine), &config);
    let handle = tokio::spawn(server.run(listener, rx, shutdown.subscribe()));

    TestServer {
        addr,
        engine,
        updates,
        shutdown,
        handle,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client")
}

/// Poll `check` until it returns true or the timeout expires.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
