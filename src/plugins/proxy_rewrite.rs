//! Rewrites the outbound request: upstream path, method, host, scheme and headers.
//!
//! Path, method, host and scheme changes go into the request's upstream overrides so the
//! client-facing request head, and every variable computed from it, stays as received. Header
//! changes apply to the forwarded headers directly.

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::response::Response;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{decode_config, BoxHandler, GatewayRequest, Handler, Plugin};
use crate::core::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderRewrite {
    /// Appended, keeping existing values
    pub add: BTreeMap<String, String>,
    /// Replacing existing values
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyRewriteConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// `[pattern, replacement]` applied to the request path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_uri: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    pub headers: HeaderRewrite,
}

type HeaderPairs = Vec<(HeaderName, HeaderValue)>;

#[derive(Debug, Default)]
pub struct ProxyRewrite {
    config: ProxyRewriteConfig,
    regex_uri: Option<(Regex, String)>,
    method: Option<Method>,
    add: HeaderPairs,
    set: HeaderPairs,
    remove: Vec<HeaderName>,
}

impl ProxyRewrite {
    pub const NAME: &'static str = "proxy-rewrite";
    pub const PRIORITY: i64 = 1008;

    fn header_pairs(headers: &BTreeMap<String, String>) -> GatewayResult<HeaderPairs> {
        headers
            .iter()
            .map(|(name, value)| {
                let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    GatewayError::plugin(Self::NAME, format!("invalid header name {}: {}", name, e))
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    GatewayError::plugin(Self::NAME, format!("invalid value for {}: {}", name, e))
                })?;
                Ok((header, value))
            })
            .collect()
    }

    /// Path and query the upstream should see, if the path is rewritten
    fn rewrite_uri(&self, req: &GatewayRequest) -> Option<String> {
        let path = if let Some(uri) = &self.config.uri {
            uri.clone()
        } else if let Some((pattern, replacement)) = &self.regex_uri {
            let current = req.path();
            if !pattern.is_match(current) {
                return None;
            }
            pattern.replace(current, replacement.as_str()).into_owned()
        } else {
            return None;
        };

        // an explicit query in the rewritten uri wins over the client's
        match req.head.uri.query() {
            Some(query) if !path.contains('?') => Some(format!("{}?{}", path, query)),
            _ => Some(path),
        }
    }
}

impl Plugin for ProxyRewrite {
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
                "uri": {"type": "string", "pattern": "^/"},
                "regex_uri": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": 2,
                    "maxItems": 2
                },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "PUT", "HEAD", "DELETE", "OPTIONS", "PATCH", "TRACE", "CONNECT"]
                },
                "host": {"type": "string"},
                "scheme": {"type": "string", "enum": ["http", "https"]},
                "headers": {
                    "type": "object",
                    "properties": {
                        "add": {"type": "object", "additionalProperties": {"type": "string"}},
                        "set": {"type": "object", "additionalProperties": {"type": "string"}},
                        "remove": {"type": "array", "items": {"type": "string"}}
                    }
                }
            }
        })
    }

    fn configure(&mut self, raw: Value) -> GatewayResult<()> {
        self.config = decode_config(Self::NAME, raw)?;
        Ok(())
    }

    fn post_init(&mut self) -> GatewayResult<()> {
        if let Some(regex_uri) = &self.config.regex_uri {
            let [pattern, replacement] = regex_uri.as_slice() else {
                return Err(GatewayError::plugin(
                    Self::NAME,
                    "regex_uri must be [pattern, replacement]",
                ));
            };
            let pattern = Regex::new(pattern).map_err(|e| {
                GatewayError::plugin(Self::NAME, format!("invalid regex_uri pattern: {}", e))
            })?;
            self.regex_uri = Some((pattern, replacement.clone()));
        }

        if let Some(method) = &self.config.method {
            self.method = Some(Method::from_bytes(method.as_bytes()).map_err(|e| {
                GatewayError::plugin(Self::NAME, format!("invalid method {}: {}", method, e))
            })?);
        }

        self.add = Self::header_pairs(&self.config.headers.add)?;
        self.set = Self::header_pairs(&self.config.headers.set)?;
        self.remove = self
            .config
            .headers
            .remove
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    GatewayError::plugin(Self::NAME, format!("invalid header name {}: {}", name, e))
                })
            })
            .collect::<GatewayResult<_>>()?;
        Ok(())
    }

    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler {
        Arc::new(ProxyRewriteHandler { plugin: self, next })
    }
}

struct ProxyRewriteHandler {
    plugin: Arc<ProxyRewrite>,
    next: BoxHandler,
}

#[async_trait]
impl Handler for ProxyRewriteHandler {
    async fn handle(&self, req: &mut GatewayRequest) -> Response {
        let plugin = &self.plugin;

        if let Some(uri) = plugin.rewrite_uri(req) {
            req.upstream.uri = Some(uri);
        }
        if let Some(method) = &plugin.method {
            req.upstream.method = Some(method.clone());
        }
        if let Some(host) = &plugin.config.host {
            req.upstream.host = Some(host.clone());
        }
        if let Some(scheme) = &plugin.config.scheme {
            req.upstream.scheme = Some(scheme.clone());
        }

        let headers = req.headers_mut();
        for (name, value) in &plugin.add {
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &plugin.set {
            headers.insert(name.clone(), value.clone());
        }
        for name in &plugin.remove {
            headers.remove(name);
        }

        self.next.handle(req).await
    }
}
