//! System plugin publishing route and service identity into the gateway variables.
//!
//! The route builder injects it into every chain with the identity of the route being built, so
//! later stages never have to resolve the route again at request time.

use async_trait::async_trait;
use axum::response::Response;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::{decode_config, BoxHandler, GatewayRequest, Handler, Plugin};
use crate::core::error::GatewayResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContextConfig {
    pub route_id: String,
    pub route_name: String,
    pub service_id: String,
    pub service_name: String,
}

#[derive(Debug, Default)]
pub struct RequestContext {
    config: RequestContextConfig,
}

impl RequestContext {
    pub const NAME: &'static str = "request-context";
    pub const PRIORITY: i64 = 9_999_999;
}

impl Plugin for RequestContext {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn priority(&self) -> i64 {
        Self::PRIORITY
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "route_id": {"type": "string"},
                "route_name": {"type": "string"},
                "service_id": {"type": "string"},
                "service_name": {"type": "string"}
            },
            "required": ["route_id"]
        })
    }

    fn configure(&mut self, raw: Value) -> GatewayResult<()> {
        self.config = decode_config(Self::NAME, raw)?;
        Ok(())
    }

    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler {
        Arc::new(RequestContextHandler { plugin: self, next })
    }
}

struct RequestContextHandler {
    plugin: Arc<RequestContext>,
    next: BoxHandler,
}

#[async_trait]
impl Handler for RequestContextHandler {
    async fn handle(&self, req: &mut GatewayRequest) -> Response {
        let config = &self.plugin.config;
        let vars = &mut req.vars.gateway;
        vars.route_id.clone_from(&config.route_id);
        vars.route_name.clone_from(&config.route_name);
        vars.service_id.clone_from(&config.service_id);
        vars.service_name.clone_from(&config.service_name);

        counter!("gateway_route_requests_total", "route" => config.route_id.clone()).increment(1);

        self.next.handle(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VarsPool;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::IntoResponse;

    struct EchoVars;

    #[async_trait]
    impl Handler for EchoVars {
        async fn handle(&self, req: &mut GatewayRequest) -> Response {
            let gateway = &req.vars.gateway;
            assert_eq!(gateway.get("route_id"), Some("r1"));
            assert_eq!(gateway.get("service_name"), Some("billing"));
            assert_eq!(gateway.get("matched_uri"), Some("/orders/:id"));
            StatusCode::NO_CONTENT.into_response()
        }
    }

    #[tokio::test]
    async fn test_identity_is_published_to_gateway_vars() {
        let mut plugin = RequestContext::default();
        plugin
            .configure(json!({"route_id": "r1", "service_id": "s1", "service_name": "billing"}))
            .unwrap();
        let chain = Arc::new(plugin).handler(Arc::new(EchoVars));

        let pool = VarsPool::new(1);
        let mut req = GatewayRequest::new(
            Request::new(Body::empty()),
            "127.0.0.1:1".parse().unwrap(),
            pool.acquire(),
        );
        req.vars.gateway.set("matched_uri", "/orders/:id");

        assert_eq!(chain.handle(&mut req).await.status(), StatusCode::NO_CONTENT);
    }
}
