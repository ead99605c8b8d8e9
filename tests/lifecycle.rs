//! Lifespan hooks, hot reload and shutdown against a live server.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchyard::http::ServerError;
use switchyard::lifecycle::{HookError, LifespanError, Shutdown};
use switchyard::{Engine, HttpServer};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const ROUTES: &str = r#"
[[middleware]]
name = "errors"

[[routes]]
path = "/version"
kind = "text"
body = "v1"
"#;

#[tokio::test]
async fn hooks_run_around_serving() {
    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let (s, t) = (Arc::clone(&started), Arc::clone(&stopped));

    let config = common::config(ROUTES);
    let builder = Engine::builder(config.clone())
        .on_startup("mark-started", move || {
            let started = Arc::clone(&s);
            async move {
                started.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .on_shutdown("mark-stopped", move || {
            let stopped = Arc::clone(&t);
            async move {
                stopped.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
    let server = common::spawn_with(builder, config).await;

    let body = common::client()
        .get(server.url("/version"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "v1");
    assert!(started.load(Ordering::SeqCst));
    assert!(!stopped.load(Ordering::SeqCst));

    server.stop().await.unwrap();
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn failed_startup_stops_the_server() {
    let config = common::config(ROUTES);
    let engine = Engine::builder(config.clone())
        .on_startup("database", || async { Err::<(), HookError>("connection refused".into()) })
        .build()
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (_updates, rx) = mpsc::unbounded_channel();
    let shutdown = Shutdown::new();

    let result = HttpServer::new(Arc::new(engine), &config)
        .run(listener, rx, shutdown.subscribe())
        .await;
    match result {
        Err(ServerError::Lifespan(LifespanError::StartupFailed(message))) => {
            assert!(message.contains("connection refused"))
        }
        other => panic!("expected startup failure, got {other:?}"),
    }
}

#[tokio::test]
async fn reload_swaps_routes_without_restart() {
    let server = common::spawn_server(ROUTES).await;
    let client = common::client();

    server
        .updates
        .send(common::config(&ROUTES.replace("v1", "v2")))
        .unwrap();
    let url = server.url("/version");
    let swapped = common::eventually(Duration::from_secs(3), || {
        let (client, url) = (client.clone(), url.clone());
        async move {
            match client.get(&url).send().await {
                Ok(response) => response.text().await.map(|b| b == "v2").unwrap_or(false),
                Err(_) => false,
            }
        }
    })
    .await;
    assert!(swapped);

    // A config naming an unknown interceptor is rejected; v2 keeps serving.
    let mut broken = common::config(ROUTES);
    broken.middleware.push(switchyard::config::MiddlewareConfig::named("nonexistent"));
    server.updates.send(broken).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let body = client.get(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "v2");
    assert_eq!(server.engine.stages(), vec!["errors"]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn debug_mode_exposes_error_traces() {
    use switchyard::dispatch::handler_fn;
    use switchyard::routing::RouteTable;

    let mut config = common::config("");
    config.debug = true;
    let table = RouteTable::new().http(
        "/boom",
        handler_fn(|_request| async { Err(switchyard::EngineError::handler("disk on fire")) }),
    );
    let builder = Engine::builder(config.clone()).resolver(Arc::new(table));
    let server = common::spawn_with(builder, config).await;

    let response = common::client().get(server.url("/boom")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().await.unwrap().contains("disk on fire"));

    server.stop().await.unwrap();
}
