use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::logger::{resolve_log_format, sink_schema_properties, AsyncLogger, LogFormat, LogSink, LoggerLayer, SinkOptions};
use super::{decode_config, BoxHandler, Plugin};
use crate::core::error::{GatewayError, GatewayResult};
use crate::store::ConfigStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLoggerConfig {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    /// Seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(flatten)]
    pub sink: SinkOptions,
}

fn default_timeout() -> u64 {
    3
}

impl Default for HttpLoggerConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            auth_header: None,
            timeout: default_timeout(),
            sink: SinkOptions::default(),
        }
    }
}

/// POSTs each entry, as a one-element JSON array, to a collector endpoint
#[derive(Debug)]
pub struct HttpLogger {
    store: Arc<ConfigStore>,
    client: reqwest::Client,
    config: HttpLoggerConfig,
    format: Arc<LogFormat>,
    logger: Option<Arc<AsyncLogger>>,
}

impl HttpLogger {
    pub const NAME: &'static str = "http-logger";
    pub const PRIORITY: i64 = 410;

    pub fn new(store: Arc<ConfigStore>, client: reqwest::Client) -> Self {
        Self {
            store,
            client,
            config: HttpLoggerConfig::default(),
            format: Arc::new(LogFormat::new()),
            logger: None,
        }
    }
}

impl Plugin for HttpLogger {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn priority(&self) -> i64 {
        Self::PRIORITY
    }

    fn schema(&self) -> Value {
        let mut properties = sink_schema_properties();
        properties.insert(
            "uri".to_string(),
            json!({"type": "string", "pattern": "^https?://"}),
        );
        properties.insert("auth_header".to_string(), json!({"type": "string"}));
        properties.insert("timeout".to_string(), json!({"type": "integer", "minimum": 1}));
        json!({
            "type": "object",
            "properties": properties,
            "required": ["uri"]
        })
    }

    fn configure(&mut self, raw: Value) -> GatewayResult<()> {
        self.config = decode_config(Self::NAME, raw)?;
        Ok(())
    }

    fn post_init(&mut self) -> GatewayResult<()> {
        let uri = url::Url::parse(&self.config.uri)
            .map_err(|e| GatewayError::plugin(Self::NAME, format!("invalid uri: {}", e)))?;

        self.format = Arc::new(resolve_log_format(
            self.config.sink.log_format.as_ref(),
            &self.store,
            Self::NAME,
        ));

        let sink = HttpSink {
            client: self.client.clone(),
            uri,
            auth_header: self.config.auth_header.clone(),
            timeout: Duration::from_secs(self.config.timeout),
        };
        self.logger = Some(Arc::new(AsyncLogger::spawn(
            Self::NAME,
            sink,
            self.config.sink.buffer_size,
            self.config.sink.policy,
        )?));
        Ok(())
    }

    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler {
        match &self.logger {
            Some(logger) => Arc::new(LoggerLayer {
                logger: Arc::clone(logger),
                format: Arc::clone(&self.format),
                next,
            }),
            None => next,
        }
    }
}

struct HttpSink {
    client: reqwest::Client,
    uri: url::Url,
    auth_header: Option<String>,
    timeout: Duration,
}

#[async_trait]
impl LogSink for HttpSink {
    async fn write(&self, entry: &Value) -> GatewayResult<()> {
        let mut request = self
            .client
            .post(self.uri.clone())
            .timeout(self.timeout)
            .json(&[entry]);
        if let Some(auth) = &self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::plugin(HttpLogger::NAME, format!("delivery failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::plugin(
                HttpLogger::NAME,
                format!("collector answered {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{GatewayRequest, Handler};
    use crate::variables::VarsPool;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::{IntoResponse, Response};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Ok200;

    #[async_trait]
    impl Handler for Ok200 {
        async fn handle(&self, _req: &mut GatewayRequest) -> Response {
            StatusCode::OK.into_response()
        }
    }

    #[tokio::test]
    async fn test_entry_is_posted_to_collector() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&collector)
            .await;

        let mut plugin = HttpLogger::new(
            Arc::new(ConfigStore::open_in_memory()),
            reqwest::Client::new(),
        );
        plugin
            .configure(json!({
                "uri": format!("{}/logs", collector.uri()),
                "auth_header": "Bearer t0k",
                "log_format": {"uri": "$uri"}
            }))
            .unwrap();
        plugin.post_init().unwrap();
        let chain = Arc::new(plugin).handler(Arc::new(Ok200));

        let pool = VarsPool::new(1);
        let mut req = GatewayRequest::new(
            Request::builder().uri("/orders").body(Body::empty()).unwrap(),
            "127.0.0.1:1".parse().unwrap(),
            pool.acquire(),
        );
        chain.handle(&mut req).await;

        let mut received = Vec::new();
        for _ in 0..100 {
            received = collector.received_requests().await.unwrap_or_default();
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        assert_eq!(received.len(), 1);
        let body: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body, json!([{"uri": "/orders"}]));
    }

    #[test]
    fn test_uri_is_required_by_schema() {
        let plugin = HttpLogger::new(
            Arc::new(ConfigStore::open_in_memory()),
            reqwest::Client::new(),
        );
        let validator = crate::plugins::SchemaValidator::new();
        assert!(validator
            .validate(HttpLogger::NAME, &plugin.schema(), &json!({"policy": "drop"}))
            .is_err());
    }
}
