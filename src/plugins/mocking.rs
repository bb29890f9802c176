//! Answers requests with a configured response without contacting the upstream.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{decode_config, BoxHandler, GatewayRequest, Handler, Plugin};
use crate::core::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockingConfig {
    /// Seconds to wait before answering
    pub delay: f64,
    pub response_status: u16,
    pub content_type: String,
    pub response_example: String,
    pub response_headers: BTreeMap<String, String>,
    pub with_mock_header: bool,
}

impl Default for MockingConfig {
    fn default() -> Self {
        Self {
            delay: 0.0,
            response_status: 200,
            content_type: "application/json;charset=utf8".to_string(),
            response_example: String::new(),
            response_headers: BTreeMap::new(),
            with_mock_header: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct Mocking {
    config: MockingConfig,
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Mocking {
    pub const NAME: &'static str = "mocking";
    pub const PRIORITY: i64 = 10900;
}

impl Plugin for Mocking {
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
                "delay": {"type": "number", "minimum": 0},
                "response_status": {"type": "integer", "minimum": 100, "maximum": 599},
                "content_type": {"type": "string"},
                "response_example": {"type": "string"},
                "response_headers": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                },
                "with_mock_header": {"type": "boolean"}
            },
            "required": ["response_example"]
        })
    }

    fn configure(&mut self, raw: Value) -> GatewayResult<()> {
        self.config = decode_config(Self::NAME, raw)?;
        Ok(())
    }

    fn post_init(&mut self) -> GatewayResult<()> {
        self.status = StatusCode::from_u16(self.config.response_status).map_err(|e| {
            GatewayError::plugin(Self::NAME, format!("invalid response_status: {}", e))
        })?;

        let mut headers = vec![(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&self.config.content_type).map_err(|e| {
                GatewayError::plugin(Self::NAME, format!("invalid content_type: {}", e))
            })?,
        )];
        for (name, value) in &self.config.response_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                GatewayError::plugin(Self::NAME, format!("invalid header name {}: {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                GatewayError::plugin(Self::NAME, format!("invalid header value for {}: {}", name, e))
            })?;
            headers.push((name, value));
        }
        if self.config.with_mock_header {
            headers.push((
                HeaderName::from_static("x-mock-by"),
                HeaderValue::from_static("api-dataplane"),
            ));
        }
        self.headers = headers;
        Ok(())
    }

    fn handler(self: Arc<Self>, _next: BoxHandler) -> BoxHandler {
        Arc::new(MockingHandler { plugin: self })
    }
}

struct MockingHandler {
    plugin: Arc<Mocking>,
}

#[async_trait]
impl Handler for MockingHandler {
    async fn handle(&self, _req: &mut GatewayRequest) -> Response {
        let plugin = &self.plugin;
        if plugin.config.delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(plugin.config.delay)).await;
        }

        let mut response = (plugin.status, Body::from(plugin.config.response_example.clone()))
            .into_response();
        let headers = response.headers_mut();
        for (name, value) in &plugin.headers {
            headers.insert(name.clone(), value.clone());
        }
        response
    }
}
