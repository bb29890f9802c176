use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::{decode_config, BoxHandler, GatewayRequest, Handler, Plugin};
use crate::core::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestIdConfig {
    pub header_name: String,
    pub include_in_response: bool,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self {
            header_name: "X-Request-Id".to_string(),
            include_in_response: true,
        }
    }
}

/// Reuses the client's request ID or generates a UUID v4 one
#[derive(Debug)]
pub struct RequestId {
    config: RequestIdConfig,
    header: HeaderName,
}

impl Default for RequestId {
    fn default() -> Self {
        Self {
            config: RequestIdConfig::default(),
            header: HeaderName::from_static("x-request-id"),
        }
    }
}

impl RequestId {
    pub const NAME: &'static str = "request-id";
    pub const PRIORITY: i64 = 12015;
}

impl Plugin for RequestId {
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
                "header_name": {"type": "string", "minLength": 1},
                "include_in_response": {"type": "boolean"}
            }
        })
    }

    fn configure(&mut self, raw: Value) -> GatewayResult<()> {
        self.config = decode_config(Self::NAME, raw)?;
        Ok(())
    }

    fn post_init(&mut self) -> GatewayResult<()> {
        self.header = HeaderName::from_bytes(self.config.header_name.as_bytes())
            .map_err(|e| GatewayError::plugin(Self::NAME, format!("invalid header_name: {}", e)))?;
        Ok(())
    }

    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler {
        Arc::new(RequestIdHandler { plugin: self, next })
    }
}

struct RequestIdHandler {
    plugin: Arc<RequestId>,
    next: BoxHandler,
}

#[async_trait]
impl Handler for RequestIdHandler {
    async fn handle(&self, req: &mut GatewayRequest) -> Response {
        let header = &self.plugin.header;

        let existing = req
            .headers()
            .get(header)
            .filter(|value| !value.is_empty())
            .cloned();
        let id = match existing {
            Some(id) => id,
            None => {
                let generated = HeaderValue::from_str(&Uuid::new_v4().to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
                req.headers_mut().insert(header.clone(), generated.clone());
                generated
            }
        };

        if let Ok(text) = id.to_str() {
            req.vars.request.set("request_id", text);
        }

        let mut response = self.next.handle(req).await;
        if self.plugin.config.include_in_response {
            response.headers_mut().insert(header.clone(), id);
        }
        response
    }
}
