//! # HTTP Server Module
//!
//! The inbound HTTP surface. Every request goes through [`dispatch`], which takes one snapshot of
//! the active routing table, matches the request and runs the matched route's chain. A `GET` on
//! `server.health_path` that no route claims is answered with the table's health report.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<ServingState>` keeps the table a request started with alive until the request is done,
//!   independent of later swaps
//! - `tokio_util::sync::CancellationToken` fans the shutdown signal out to the server and every
//!   background task
//! - Tower layers for request tracing and the inbound body limit

use axum::{
    extract::{ConnectInfo, Request, State},
    http::Method,
    response::{IntoResponse, Response},
    Json, Router as AxumRouter,
};
use metrics::counter;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::reload::{ActiveTable, ServingState};
use crate::core::context::GatewayContext;
use crate::core::error::{GatewayError, GatewayResult};
use crate::plugins::GatewayRequest;

/// Shared state of the axum application
#[derive(Debug, Clone)]
pub struct ServerState {
    pub ctx: GatewayContext,
    pub active: Arc<ActiveTable>,
}

pub struct GatewayServer {
    state: ServerState,
}

impl GatewayServer {
    pub fn new(ctx: GatewayContext, active: Arc<ActiveTable>) -> Self {
        Self {
            state: ServerState { ctx, active },
        }
    }

    /// The axum application, without binding a socket
    pub fn app(&self) -> AxumRouter {
        let max_body_size = self.state.ctx.settings.server.max_body_size;
        AxumRouter::new()
            .fallback(dispatch)
            .layer(RequestBodyLimitLayer::new(max_body_size))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.state.ctx.settings.server.listen
    }

    /// Serve until `shutdown` is cancelled, then drain for at most the configured grace period
    pub async fn run(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let listen = self.listen_addr();
        let grace = self.state.ctx.settings.server.shutdown_timeout;

        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| GatewayError::internal(format!("Failed to bind {}: {}", listen, e)))?;
        info!(listen = %listen, "Gateway HTTP server listening");

        let stop = shutdown.clone();
        let server = axum::serve(
            listener,
            self.app()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => {
                result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;
            }
            _ = shutdown.cancelled() => {
                info!(grace = ?grace, "Draining in-flight requests");
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(result) => {
                        result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;
                        info!("Server shutdown completed gracefully");
                    }
                    Err(_) => warn!(grace = ?grace, "Grace period elapsed, closing remaining connections"),
                }
            }
        }

        Ok(())
    }
}

/// Route, then run the matched chain
pub async fn dispatch(
    State(state): State<ServerState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let serving = state.active.load();
    let remote_addr = connect_info
        .map(|ConnectInfo(addr)| addr)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let mut req = GatewayRequest::new(request, remote_addr, state.ctx.vars.acquire());

    let Some(found) = serving.table.lookup(req.method(), req.host(), req.path()) else {
        let health_path = state.ctx.settings.server.health_path.as_deref();
        if *req.method() == Method::GET && health_path == Some(req.path()) {
            return health(&serving).into_response();
        }

        counter!("requests_unmatched_total").increment(1);
        debug!(method = %req.method(), path = %req.path(), "No route matched");
        return GatewayError::RouteNotFound {
            method: req.method().to_string(),
            path: req.path().to_string(),
        }
        .into_response();
    };

    debug!(
        route_id = %found.route_id,
        matched_uri = %found.matched_uri,
        generation = serving.generation,
        "Route matched"
    );
    req.params = found.params;
    req.vars.gateway.matched_uri.push_str(found.matched_uri);
    let handler = Arc::clone(found.handler);

    handler.handle(&mut req).await
}

fn health(serving: &ServingState) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "generation": serving.generation,
        "routes": serving.table.route_count(),
        "built_at": serving.built_at.to_rfc3339(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Resolve when the process is asked to stop
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let unix_signals = async {
        use tokio::signal::unix::{signal, SignalKind};

        let kinds = [
            SignalKind::terminate(),
            SignalKind::hangup(),
            SignalKind::quit(),
        ];
        let mut streams = Vec::new();
        for kind in kinds {
            match signal(kind) {
                Ok(stream) => streams.push(stream),
                Err(e) => warn!(error = %e, "Failed to install signal handler"),
            }
        }
        if streams.is_empty() {
            std::future::pending::<()>().await;
        }
        let waits = streams.iter_mut().map(|stream| Box::pin(stream.recv()));
        futures::future::select_all(waits).await;
    };

    #[cfg(not(unix))]
    let unix_signals = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = unix_signals => info!("Received termination signal, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ROUTES;
    use crate::core::config::GatewaySettings;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{json, Value};

    fn server_with_routes(routes: &[(&str, Value)]) -> (GatewayServer, Arc<ActiveTable>) {
        server_with_settings(GatewaySettings::default(), routes)
    }

    fn server_with_settings(
        settings: GatewaySettings,
        routes: &[(&str, Value)],
    ) -> (GatewayServer, Arc<ActiveTable>) {
        let ctx = GatewayContext::new(
            settings,
            Arc::new(crate::store::ConfigStore::open_in_memory()),
            crate::plugins::PluginRegistry::with_defaults(),
        )
        .unwrap();
        for (id, route) in routes {
            ctx.store
                .put(ROUTES, id, serde_json::to_vec(route).unwrap())
                .unwrap();
        }
        let table = crate::routing::RouteBuilder::new(ctx.clone()).build();
        let active = Arc::new(ActiveTable::default());
        active.swap(table);
        (GatewayServer::new(ctx, Arc::clone(&active)), active)
    }

    #[tokio::test]
    async fn test_unmatched_request_is_json_404() {
        let (server, _) = server_with_routes(&[]);
        let client = TestServer::new(server.app()).unwrap();

        let response = client.get("/nowhere").await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], 404);
    }

    #[tokio::test]
    async fn test_healthz_reports_generation_and_routes() {
        let (server, _) = server_with_routes(&[(
            "1",
            json!({"uri": "/get", "upstream": {"nodes": {"127.0.0.1:1": 1}}}),
        )]);
        let client = TestServer::new(server.app()).unwrap();

        let body: Value = client.get("/healthz").await.json();
        assert_eq!(body["generation"], 1);
        assert_eq!(body["routes"], 1);
    }

    #[tokio::test]
    async fn test_mocked_route_answers_through_dispatch() {
        let (server, _) = server_with_routes(&[(
            "mock",
            json!({
                "uri": "/mock/:id",
                "methods": ["GET"],
                "upstream": {"nodes": {"127.0.0.1:1": 1}},
                "plugins": {"mocking": {"response_status": 201, "response_example": "hello"}}
            }),
        )]);
        let client = TestServer::new(server.app()).unwrap();

        let response = client.get("/mock/7").await;
        response.assert_status(StatusCode::CREATED);
        response.assert_text("hello");
        assert_eq!(response.header("x-mock-by"), "api-dataplane");

        client.post("/mock/7").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_user_route_at_health_path_wins() {
        let (server, _) = server_with_routes(&[(
            "health",
            json!({
                "uri": "/healthz",
                "upstream": {"nodes": {"127.0.0.1:1": 1}},
                "plugins": {"mocking": {"response_status": 200, "response_example": "mine"}}
            }),
        )]);
        let client = TestServer::new(server.app()).unwrap();

        client.get("/healthz").await.assert_text("mine");
    }

    #[tokio::test]
    async fn test_health_path_follows_settings() {
        let mut settings = GatewaySettings::default();
        settings.server.health_path = Some("/-/ready".to_string());
        let (server, _) = server_with_settings(settings, &[]);
        let client = TestServer::new(server.app()).unwrap();

        let body: Value = client.get("/-/ready").await.json();
        assert_eq!(body["status"], "healthy");
        client.get("/healthz").await.assert_status(StatusCode::NOT_FOUND);
        client.post("/-/ready").await.assert_status(StatusCode::NOT_FOUND);

        let mut settings = GatewaySettings::default();
        settings.server.health_path = None;
        let (server, _) = server_with_settings(settings, &[]);
        let client = TestServer::new(server.app()).unwrap();
        client.get("/healthz").await.assert_status(StatusCode::NOT_FOUND);
    }
}
