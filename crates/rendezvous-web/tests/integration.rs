//! Integration tests for the rendezvous-web HTTP surface.
//!
//! These tests spin up the **real** Axum server on an OS-assigned ephemeral
//! port and make actual HTTP requests via `reqwest`.

use std::net::SocketAddr;

use serde_json::Value;
use tokio::net::TcpListener;

use rendezvous_broker::{Broker, BrokerConfig};
use rendezvous_web::{WebConfig, WebServer};

// ── helpers ──────────────────────────────────────────────────────────────────

/// Bind to 127.0.0.1:0, start the server, return (base_url, broker).
async fn start_test_server(config: WebConfig) -> (String, Broker) {
    let broker = Broker::new(BrokerConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to port 0");
    let addr: SocketAddr = listener.local_addr().expect("get local addr");
    let base = format!("http://127.0.0.1:{}", addr.port());

    let server = WebServer::new(config, broker.clone());
    tokio::spawn(async move {
        server.serve(listener, std::future::pending()).await.ok();
    });

    // Small yield so the listener is ready.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    (base, broker)
}

// ── WebConfig ────────────────────────────────────────────────────────────────

#[test]
fn web_config_defaults() {
    let config = WebConfig::default();
    assert_eq!(config.bind_addr, "127.0.0.1");
    assert_eq!(config.port, 3000);
    assert!(config.static_dir.is_none());
}

#[test]
fn web_config_builders() {
    let config = WebConfig::default()
        .with_bind_addr("0.0.0.0")
        .with_port(8080)
        .with_static_dir("/srv/ui");
    assert_eq!(config.bind_addr, "0.0.0.0");
    assert_eq!(config.port, 8080);
    assert_eq!(config.static_dir.as_deref(), Some(std::path::Path::new("/srv/ui")));
}

#[test]
fn server_addr_joins_host_and_port() {
    let server = WebServer::new(
        WebConfig::default().with_port(4321),
        Broker::new(BrokerConfig::default()),
    );
    assert_eq!(server.addr(), "127.0.0.1:4321");
}

// ── GET /api/status ──────────────────────────────────────────────────────────

#[tokio::test]
async fn status_reports_relations_and_connections() {
    let (base, broker) = start_test_server(WebConfig::default()).await;
    let _source = broker.open_source_session();

    let resp = reqwest::get(format!("{base}/api/status")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["open_connections"], 1);

    let relations = body["relations"].as_array().unwrap();
    assert_eq!(relations.len(), 2);
    assert_eq!(relations[0]["relation"], "key_translation");
    assert_eq!(relations[1]["relation"], "deployment_notification");
    assert_eq!(relations[0]["waiting"], 0);
}

#[tokio::test]
async fn status_allows_cross_origin_reads() {
    let (base, _broker) = start_test_server(WebConfig::default()).await;

    let resp = reqwest::Client::new()
        .get(format!("{base}/api/status"))
        .header("Origin", "http://example.test")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}

// ── static assets ────────────────────────────────────────────────────────────

#[tokio::test]
async fn static_dir_is_served_at_root() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>rendezvous</h1>").unwrap();

    let (base, _broker) =
        start_test_server(WebConfig::default().with_static_dir(dir.path())).await;

    let resp = reqwest::get(format!("{base}/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "<h1>rendezvous</h1>");
}

#[tokio::test]
async fn unknown_path_without_static_dir_is_404() {
    let (base, _broker) = start_test_server(WebConfig::default()).await;

    let resp = reqwest::get(format!("{base}/index.html")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn websocket_endpoints_require_upgrade() {
    let (base, _broker) = start_test_server(WebConfig::default()).await;

    let resp = reqwest::get(format!("{base}/targetAPI")).await.unwrap();
    assert!(resp.status().is_client_error());
}
