//! # Standalone Feed Tests
//!
//! Resource files feeding the store, both at startup and while watched.

use api_dataplane::feed::{ConfigFeed, StandaloneFeed};
use api_dataplane::store::{event_pool, ConfigStore, ROUTES};
use api_dataplane::{ActiveTable, GatewayContext, GatewaySettings, RouteBuilder};
use api_dataplane::plugins::PluginRegistry;
use axum::http::Method;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RESOURCES: &str = r#"
upstreams:
  - id: backend
    nodes:
      "127.0.0.1:8080": 1
services:
  - id: orders
    upstream_id: backend
    hosts: ["orders.example.com"]
routes:
  - id: 1
    uri: /orders/*
    service_id: orders
  - id: 2
    uri: /status
    upstream_id: backend
consumers:
  - username: jack
    plugins:
      key-auth:
        key: auth-one
"#;

async fn write_resources(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("resources.yaml");
    tokio::fs::write(&path, content).await.unwrap();
    path
}

#[tokio::test]
async fn test_fetched_resources_build_a_routing_table() {
    let dir = TempDir::new().unwrap();
    let path = write_resources(&dir, RESOURCES).await;

    let feed = StandaloneFeed::new(&path, "/apisix");
    let store = Arc::new(ConfigStore::open_in_memory());
    store.replace_all(&feed.fetch_all().await.unwrap()).unwrap();

    assert_eq!(store.consumer_by_plugin_key("key-auth", "auth-one").unwrap(), "jack");

    let ctx = GatewayContext::new(
        GatewaySettings::default(),
        Arc::clone(&store),
        PluginRegistry::with_defaults(),
    )
    .unwrap();
    let table = RouteBuilder::new(ctx).build();
    assert_eq!(table.route_count(), 2);

    // hosts come from the service when the route has none
    assert!(table
        .lookup(&Method::GET, Some("orders.example.com"), "/orders/42")
        .is_some());
    assert!(table
        .lookup(&Method::GET, Some("other.example.com"), "/orders/42")
        .is_none());
    assert!(table.lookup(&Method::GET, None, "/status").is_some());
}

#[tokio::test]
async fn test_missing_resource_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let feed = StandaloneFeed::new(dir.path().join("absent.yaml"), "/apisix");
    assert!(feed.fetch_all().await.is_err());
}

#[tokio::test]
async fn test_file_rewrite_reaches_the_store() {
    let dir = TempDir::new().unwrap();
    let path = write_resources(&dir, RESOURCES).await;

    let feed = Arc::new(StandaloneFeed::new(&path, "/apisix"));
    let ctx = GatewayContext::in_memory().unwrap();
    ctx.store.replace_all(&feed.fetch_all().await.unwrap()).unwrap();

    let shutdown = CancellationToken::new();
    let (sender, receiver) = mpsc::channel(16);
    let consumer = tokio::spawn(Arc::clone(&ctx.store).run(receiver, shutdown.clone()));
    let watcher = {
        let feed = Arc::clone(&feed);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { feed.watch(event_pool(16), sender, shutdown).await })
    };

    // give the watcher time to register before touching the file
    tokio::time::sleep(Duration::from_millis(200)).await;
    let updated = RESOURCES.replace("uri: /status", "uri: /health");
    let updated = updated.replace(
        "consumers:\n  - username: jack\n    plugins:\n      key-auth:\n        key: auth-one\n",
        "",
    );
    tokio::fs::write(&path, updated).await.unwrap();

    let mut applied = false;
    for _ in 0..100 {
        let route = ctx.store.get_route("2");
        if route.map(|r| r.uri.as_deref() == Some("/health")).unwrap_or(false) {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(applied, "rewritten route never reached the store");
    assert!(ctx.store.get_consumer("jack").is_err());
    assert!(ctx.store.consumer_by_plugin_key("key-auth", "auth-one").is_err());

    let active = ActiveTable::default();
    active.swap(RouteBuilder::new(ctx.clone()).build());
    assert!(active.load().table.lookup(&Method::GET, None, "/health").is_some());
    assert_eq!(ctx.store.list(ROUTES).unwrap().len(), 2);

    shutdown.cancel();
    watcher.await.unwrap().unwrap();
    consumer.await.unwrap();
}
