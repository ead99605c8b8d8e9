//! End-to-end HTTP behavior through the axum adapter.

mod common;

use std::io::Read;

use reqwest::StatusCode;

const PIPELINE: &str = r#"
[[middleware]]
name = "errors"

[[middleware]]
name = "request_id"

[[middleware]]
name = "cors"
[middleware.options]
allow_origins = ["https://app.example"]
allow_methods = ["GET", "POST"]

[[middleware]]
name = "auth"
[middleware.options.tokens.secret-token]
principal = "ops"
tags = ["ops"]

[[middleware]]
name = "cache"

[[middleware]]
name = "gzip"

[[routes]]
path = "/hello"
kind = "text"
body = "hello"

[[routes]]
path = "/big"
kind = "text"
body = """
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
"""

[[routes]]
path = "/echo"
kind = "echo"

[[routes]]
path = "/ops"
kind = "text"
body = "ops only"
required_tags = ["ops"]

[[routes]]
path = "/old"
kind = "redirect"
location = "/hello"
"#;

#[tokio::test]
async fn buffered_route_sets_length_and_request_id() {
    let server = common::spawn_server(PIPELINE).await;
    let client = common::client();

    let response = client.get(server.url("/hello")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "5");
    assert_eq!(response.headers()["content-type"], "text/plain; charset=utf-8");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.text().await.unwrap(), "hello");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn head_sends_headers_only() {
    let server = common::spawn_server(PIPELINE).await;

    let response = common::client().head(server.url("/hello")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "5");
    assert!(response.bytes().await.unwrap().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_path_is_a_json_404() {
    let server = common::spawn_server(PIPELINE).await;

    let response = common::client().get(server.url("/nope")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "Not Found");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn echo_streams_the_request_body_back() {
    let server = common::spawn_server(PIPELINE).await;

    let response = common::client()
        .post(server.url("/echo"))
        .header("content-type", "application/json")
        .body(r#"{"n":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.text().await.unwrap(), r#"{"n":1}"#);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn redirect_carries_location() {
    let server = common::spawn_server(PIPELINE).await;

    let response = common::client().get(server.url("/old")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()["location"], "/hello");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn large_bodies_are_gzipped_small_ones_are_not() {
    let server = common::spawn_server(PIPELINE).await;
    let client = common::client();

    let big = client
        .get(server.url("/big"))
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(big.headers()["content-encoding"], "gzip");
    assert_eq!(big.headers()["vary"], "Accept-Encoding");
    let compressed = big.bytes().await.unwrap();
    let mut plain = String::new();
    flate2::read::GzDecoder::new(&compressed[..])
        .read_to_string(&mut plain)
        .unwrap();
    assert!(plain.len() > 500);
    assert!(plain.chars().all(|c| c == 'a' || c == '\n'));

    let small = client
        .get(server.url("/hello"))
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert!(!small.headers().contains_key("content-encoding"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn matching_etag_yields_304() {
    let server = common::spawn_server(PIPELINE).await;
    let client = common::client();

    let first = client.get(server.url("/hello")).send().await.unwrap();
    let etag = first.headers()["etag"].to_str().unwrap().to_string();
    assert_eq!(first.headers()["cache-control"], "public, max-age=60");

    let second = client
        .get(server.url("/hello"))
        .header("if-none-match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(second.headers()["etag"], etag.as_str());
    assert!(second.bytes().await.unwrap().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn credentials_select_tags_and_refusals_keep_cors_headers() {
    let server = common::spawn_server(PIPELINE).await;
    let client = common::client();

    let anonymous = client.get(server.url("/ops")).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let granted = client
        .get(server.url("/ops"))
        .bearer_auth("secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(granted.status(), StatusCode::OK);
    assert_eq!(granted.text().await.unwrap(), "ops only");

    let refused = client
        .get(server.url("/hello"))
        .header("origin", "https://app.example")
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), StatusCode::UNAUTHORIZED);
    assert!(refused.headers()["www-authenticate"]
        .to_str()
        .unwrap()
        .starts_with("Bearer"));
    assert_eq!(refused.headers()["access-control-allow-origin"], "https://app.example");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn cors_preflight_is_answered_before_auth() {
    let server = common::spawn_server(PIPELINE).await;

    let response = common::client()
        .request(reqwest::Method::OPTIONS, server.url("/ops"))
        .header("origin", "https://app.example")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "https://app.example");
    assert_eq!(response.headers()["access-control-max-age"], "600");

    server.stop().await.unwrap();
}
