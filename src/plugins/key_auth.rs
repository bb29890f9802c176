//! API key authentication against consumers' `key-auth` credentials.
//!
//! The key is taken from a header, falling back to a query parameter. It is resolved through the
//! store's consumer credential index, so lookup cost does not grow with the number of consumers.

use async_trait::async_trait;
use axum::http::uri::PathAndQuery;
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{decode_config, message_response, BoxHandler, GatewayRequest, Handler, Plugin};
use crate::core::error::GatewayResult;
use crate::store::ConfigStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyAuthConfig {
    pub header: String,
    pub query: String,
    /// Strip the credential before the request is forwarded
    pub hide_credentials: bool,
}

impl Default for KeyAuthConfig {
    fn default() -> Self {
        Self {
            header: "apikey".to_string(),
            query: "apikey".to_string(),
            hide_credentials: false,
        }
    }
}

#[derive(Debug)]
pub struct KeyAuth {
    store: Arc<ConfigStore>,
    config: KeyAuthConfig,
}

impl KeyAuth {
    pub const NAME: &'static str = "key-auth";
    pub const PRIORITY: i64 = 2500;

    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            config: KeyAuthConfig::default(),
        }
    }
}

impl Plugin for KeyAuth {
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
                "header": {"type": "string", "minLength": 1},
                "query": {"type": "string", "minLength": 1},
                "hide_credentials": {"type": "boolean"}
            }
        })
    }

    fn configure(&mut self, raw: Value) -> GatewayResult<()> {
        self.config = decode_config(Self::NAME, raw)?;
        Ok(())
    }

    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler {
        Arc::new(KeyAuthHandler { plugin: self, next })
    }
}

enum KeySource {
    Header,
    Query,
}

struct KeyAuthHandler {
    plugin: Arc<KeyAuth>,
    next: BoxHandler,
}

impl KeyAuthHandler {
    fn find_key(&self, req: &GatewayRequest) -> Option<(String, KeySource)> {
        let config = &self.plugin.config;
        if let Some(key) = req.header(&config.header).filter(|key| !key.is_empty()) {
            return Some((key.to_string(), KeySource::Header));
        }
        req.query_param(&config.query)
            .filter(|key| !key.is_empty())
            .map(|key| (key, KeySource::Query))
    }

    fn hide_credentials(&self, req: &mut GatewayRequest, source: KeySource) {
        let config = &self.plugin.config;
        match source {
            KeySource::Header => {
                req.headers_mut().remove(config.header.as_str());
            }
            KeySource::Query => {
                if let Some(uri) = without_query_param(&req.head.uri, &config.query) {
                    req.head.uri = uri;
                }
            }
        }
    }
}

#[async_trait]
impl Handler for KeyAuthHandler {
    async fn handle(&self, req: &mut GatewayRequest) -> Response {
        let Some((key, source)) = self.find_key(req) else {
            counter!("key_auth_rejections_total", "reason" => "missing").increment(1);
            return message_response(StatusCode::UNAUTHORIZED, "Missing API key in request");
        };

        let snapshot = self.plugin.store.snapshot();
        let consumer_id = match snapshot.consumer_by_plugin_key(KeyAuth::NAME, &key) {
            Ok(consumer_id) => consumer_id,
            Err(_) => {
                counter!("key_auth_rejections_total", "reason" => "invalid").increment(1);
                return message_response(StatusCode::UNAUTHORIZED, "Invalid API key in request");
            }
        };

        match snapshot.get_consumer(&consumer_id) {
            Ok(consumer) => {
                let username = if consumer.username.is_empty() {
                    consumer_id.as_str()
                } else {
                    consumer.username.as_str()
                };
                req.vars.gateway.set("consumer_name", username);
                if let Some(group) = consumer.group_id.as_deref() {
                    req.vars.gateway.set("consumer_group_id", group);
                }
                debug!(consumer = %username, "Consumer authenticated");
            }
            Err(e) => {
                // the index and the bucket change together, so this only happens for a racing delete
                warn!(consumer_id = %consumer_id, error = %e, "Indexed consumer could not be loaded");
                return message_response(StatusCode::UNAUTHORIZED, "Invalid API key in request");
            }
        }

        if self.plugin.config.hide_credentials {
            self.hide_credentials(req, source);
        }

        self.next.handle(req).await
    }
}

/// `uri` with every occurrence of query parameter `name` removed
fn without_query_param(uri: &Uri, name: &str) -> Option<Uri> {
    let query = uri.query()?;
    let kept: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key != name)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let path_and_query = if kept.is_empty() {
        uri.path().to_string()
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        format!("{}?{}", uri.path(), query)
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CONSUMERS;
    use crate::variables::VarsPool;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::IntoResponse;

    struct Upstream;

    #[async_trait]
    impl Handler for Upstream {
        async fn handle(&self, req: &mut GatewayRequest) -> Response {
            let body = json!({
                "consumer": req.vars.gateway.get("consumer_name"),
                "group": req.vars.gateway.get("consumer_group_id"),
                "header": req.header("apikey"),
                "uri": req.head.uri.to_string(),
            });
            axum::Json(body).into_response()
        }
    }

    fn chain(config: Value) -> (BoxHandler, VarsPool) {
        let store = Arc::new(ConfigStore::open_in_memory());
        store
            .put(
                CONSUMERS,
                "jack",
                r#"{"username":"jack","group_id":"gold","plugins":{"key-auth":{"key":"auth-one"}}}"#,
            )
            .unwrap();

        let mut plugin = KeyAuth::new(store);
        plugin.configure(config).unwrap();
        (Arc::new(plugin).handler(Arc::new(Upstream)), VarsPool::new(2))
    }

    async fn call(chain: &BoxHandler, pool: &VarsPool, req: Request<Body>) -> (StatusCode, Value) {
        let mut req = GatewayRequest::new(req, "127.0.0.1:1".parse().unwrap(), pool.acquire());
        let response = chain.handle(&mut req).await;
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_missing_and_invalid_keys_are_rejected() {
        let (chain, pool) = chain(json!({}));

        let (status, body) = call(&chain, &pool, Request::new(Body::empty())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"message": "Missing API key in request"}));

        let req = Request::builder().header("apikey", "wrong").body(Body::empty()).unwrap();
        let (status, body) = call(&chain, &pool, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"message": "Invalid API key in request"}));
    }

    #[tokio::test]
    async fn test_valid_key_attaches_consumer() {
        let (chain, pool) = chain(json!({}));

        let req = Request::builder().header("apikey", "auth-one").body(Body::empty()).unwrap();
        let (status, body) = call(&chain, &pool, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["consumer"], "jack");
        assert_eq!(body["group"], "gold");
        assert_eq!(body["header"], "auth-one");
    }

    #[tokio::test]
    async fn test_hide_credentials_strips_query_key() {
        let (chain, pool) = chain(json!({"hide_credentials": true}));

        let req = Request::builder()
            .uri("/get?apikey=auth-one&page=2")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&chain, &pool, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uri"], "/get?page=2");
    }

    #[test]
    fn test_without_query_param_drops_empty_query() {
        let uri: Uri = "/get?apikey=x".parse().unwrap();
        assert_eq!(without_query_param(&uri, "apikey").unwrap(), "/get");
    }
}
