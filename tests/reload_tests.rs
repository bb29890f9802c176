//! # Reload Integration Tests
//!
//! Table swaps driven by store changes, and containment of a build that panics.

use api_dataplane::core::error::GatewayResult;
use api_dataplane::plugins::{BoxHandler, Plugin, PluginRegistry};
use api_dataplane::store::{ConfigStore, ROUTES};
use api_dataplane::{ActiveTable, GatewayContext, GatewayServer, GatewaySettings, ReloadOrchestrator};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

static STALLING_ENTERED: AtomicBool = AtomicBool::new(false);

/// Panics while being configured
struct Exploding;

impl Plugin for Exploding {
    fn name(&self) -> &'static str {
        "exploding"
    }

    fn priority(&self) -> i64 {
        1
    }

    fn schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn configure(&mut self, _raw: Value) -> GatewayResult<()> {
        panic!("exploding plugin configured");
    }

    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler {
        next
    }
}

/// Holds the build for a while, then panics
struct Stalling;

impl Plugin for Stalling {
    fn name(&self) -> &'static str {
        "stalling"
    }

    fn priority(&self) -> i64 {
        1
    }

    fn schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn configure(&mut self, _raw: Value) -> GatewayResult<()> {
        STALLING_ENTERED.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        panic!("stalling plugin configured");
    }

    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler {
        next
    }
}

fn route(uri: &str, plugins: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "uri": uri,
        "upstream": {"nodes": {"127.0.0.1:8080": 1}},
        "plugins": plugins
    }))
    .unwrap()
}

fn context(check_interval: Duration) -> GatewayContext {
    let mut settings = GatewaySettings::default();
    settings.reload.check_interval = check_interval;

    let mut registry = PluginRegistry::with_defaults();
    registry.register("exploding", |_| Box::new(Exploding));
    registry.register("stalling", |_| Box::new(Stalling));

    GatewayContext::new(settings, Arc::new(ConfigStore::open_in_memory()), registry).unwrap()
}

#[tokio::test]
async fn test_panicking_build_keeps_previous_table() {
    let ctx = context(Duration::from_secs(60));
    let active = Arc::new(ActiveTable::default());
    let (orchestrator, _hook) = ReloadOrchestrator::new(&ctx, Arc::clone(&active));

    ctx.store.put(ROUTES, "good", route("/good", json!({}))).unwrap();
    assert_eq!(orchestrator.reload().await.unwrap(), 1);

    ctx.store
        .put(ROUTES, "bad", route("/bad", json!({"exploding": {}})))
        .unwrap();
    assert!(orchestrator.reload().await.is_err());

    let serving = active.load();
    assert_eq!(serving.generation, 1);
    assert!(serving.table.lookup(&Method::GET, None, "/good").is_some());
    assert!(serving.table.lookup(&Method::GET, None, "/bad").is_none());

    // the orchestrator is still usable once the bad route is gone
    ctx.store.delete(ROUTES, "bad").unwrap();
    assert_eq!(orchestrator.reload().await.unwrap(), 2);
}

#[tokio::test]
async fn test_store_change_is_picked_up_on_tick() {
    let ctx = context(Duration::from_millis(20));
    let active = Arc::new(ActiveTable::default());
    let (orchestrator, hook) = ReloadOrchestrator::new(&ctx, Arc::clone(&active));
    ctx.store.add_hook(Arc::new(hook));

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(orchestrator.run(shutdown.clone()));

    // several changes between two ticks collapse into few reloads
    for id in ["a", "b", "c"] {
        ctx.store
            .put(ROUTES, id, route(&format!("/{}", id), json!({})))
            .unwrap();
    }

    let mut found = false;
    for _ in 0..100 {
        if active.load().table.lookup(&Method::GET, None, "/c").is_some() {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(found, "route /c never became routable");
    assert!(active.generation() <= 3);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_in_flight_snapshot_survives_swap() {
    let ctx = context(Duration::from_secs(60));
    let active = Arc::new(ActiveTable::default());
    let (orchestrator, _hook) = ReloadOrchestrator::new(&ctx, Arc::clone(&active));

    ctx.store.put(ROUTES, "1", route("/old", json!({}))).unwrap();
    orchestrator.reload().await.unwrap();
    let in_flight = active.load();

    ctx.store.delete(ROUTES, "1").unwrap();
    orchestrator.reload().await.unwrap();

    assert!(in_flight.table.lookup(&Method::GET, None, "/old").is_some());
    assert!(active.load().table.lookup(&Method::GET, None, "/old").is_none());
}

#[tokio::test]
async fn test_requests_are_served_while_a_build_panics() {
    let ctx = context(Duration::from_secs(60));
    let active = Arc::new(ActiveTable::default());
    let (orchestrator, _hook) = ReloadOrchestrator::new(&ctx, Arc::clone(&active));
    let app = GatewayServer::new(ctx.clone(), Arc::clone(&active)).app();

    ctx.store
        .put(
            ROUTES,
            "good",
            route("/good", json!({"mocking": {"response_status": 200, "response_example": "still here"}})),
        )
        .unwrap();
    assert_eq!(orchestrator.reload().await.unwrap(), 1);

    ctx.store
        .put(ROUTES, "bad", route("/bad", json!({"stalling": {}})))
        .unwrap();

    let during_build = async {
        while !STALLING_ENTERED.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let request = Request::builder().uri("/good").body(Body::empty()).unwrap();
        app.clone().oneshot(request).await.unwrap()
    };
    let (reload, response) = tokio::join!(orchestrator.reload(), during_build);

    assert!(reload.is_err());
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"still here");

    // and after the failed build
    let request = Request::builder().uri("/good").body(Body::empty()).unwrap();
    assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
    let request = Request::builder().uri("/bad").body(Body::empty()).unwrap();
    assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::NOT_FOUND);
    assert_eq!(active.generation(), 1);
}
