//! Request handlers and the request object flowing through a chain.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{request, HeaderMap, Method, Request};
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::variables::RequestVariables;

/// One stage of a plugin chain, or the terminal proxy
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut GatewayRequest) -> Response;
}

/// Shared, type-erased handler
pub type BoxHandler = Arc<dyn Handler>;

/// Adjustments to the outbound request that must not touch the client-facing request head
#[derive(Debug, Clone, Default)]
pub struct UpstreamOverrides {
    /// Path and query sent upstream
    pub uri: Option<String>,
    pub method: Option<Method>,
    /// `Host` header sent upstream, taking precedence over `pass_host`
    pub host: Option<String>,
    pub scheme: Option<String>,
}

/// An inbound request on its way through a chain
///
/// The head stays readable for the whole lifetime of the request so transport variables can be
/// computed after the inner chain returned. The body is taken exactly once, by whichever stage
/// consumes it.
pub struct GatewayRequest {
    pub head: request::Parts,
    pub body: Option<Body>,
    pub remote_addr: SocketAddr,
    /// Named path parameters captured by the route pattern
    pub params: Vec<(String, String)>,
    pub vars: RequestVariables,
    pub upstream: UpstreamOverrides,
}

impl std::fmt::Debug for GatewayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRequest")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("remote_addr", &self.remote_addr)
            .field("params", &self.params)
            .finish()
    }
}

impl GatewayRequest {
    pub fn new(req: Request<Body>, remote_addr: SocketAddr, vars: RequestVariables) -> Self {
        let (head, body) = req.into_parts();
        Self {
            head,
            body: Some(body),
            remote_addr,
            params: Vec::new(),
            vars,
            upstream: UpstreamOverrides::default(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        self.head.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    /// Header value as text; non UTF-8 values are treated as absent
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Request host without port, from `Host` or the absolute request URI
    pub fn host(&self) -> Option<&str> {
        let raw = self.header("host").or_else(|| self.head.uri.host())?;
        Some(strip_port(raw))
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First value of a decoded query parameter
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.head.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Take the body for forwarding; later callers get an empty body
    pub fn take_body(&mut self) -> Body {
        self.body.take().unwrap_or_else(Body::empty)
    }
}

fn strip_port(host: &str) -> &str {
    // bracketed IPv6 literal, keep the brackets off as well
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VarsPool;

    #[test]
    fn test_host_strips_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:9080"), "::1");
    }

    #[test]
    fn test_query_param_is_decoded() {
        let pool = VarsPool::new(1);
        let req = Request::builder()
            .uri("/search?q=hello%20world&q=second")
            .body(Body::empty())
            .unwrap();
        let mut req = GatewayRequest::new(req, "127.0.0.1:1".parse().unwrap(), pool.acquire());

        assert_eq!(req.query_param("q").as_deref(), Some("hello world"));
        assert_eq!(req.query_param("missing"), None);

        let _ = req.take_body();
        assert!(req.body.is_none());
    }
}
