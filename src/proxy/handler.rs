//! Terminal stage of every chain: forwards the request to a balanced upstream target.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response as HttpResponse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use metrics::counter;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use super::transport::{strip_hop_by_hop, UpstreamTransport};
use crate::core::error::GatewayError;
use crate::core::types::{PassHost, Upstream};
use crate::load_balancing::LoadBalancer;
use crate::plugins::{GatewayRequest, Handler};

/// Per-upstream forwarding options resolved at build time
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    pub upstream_id: String,
    pub pass_host: PassHost,
    pub upstream_host: Option<String>,
    /// Bound on the whole upstream exchange, response body included
    pub read_timeout: Option<Duration>,
}

impl ForwardOptions {
    pub fn from_upstream(upstream: &Upstream) -> Self {
        let read_timeout = upstream
            .timeout
            .map(|timeout| timeout.read)
            .filter(|seconds| *seconds > 0.0)
            .map(Duration::from_secs_f64);

        Self {
            upstream_id: upstream.id.clone(),
            pass_host: upstream.pass_host,
            upstream_host: upstream.upstream_host.clone().filter(|host| !host.is_empty()),
            read_timeout,
        }
    }
}

pub struct ProxyHandler {
    balancer: Arc<dyn LoadBalancer>,
    transport: UpstreamTransport,
    options: ForwardOptions,
}

impl ProxyHandler {
    pub fn new(
        balancer: Arc<dyn LoadBalancer>,
        transport: UpstreamTransport,
        options: ForwardOptions,
    ) -> Self {
        Self {
            balancer,
            transport,
            options,
        }
    }

    /// Target base URL joined with the (possibly rewritten) path and query
    fn upstream_url(&self, target: &Url, req: &GatewayRequest) -> Result<Url, GatewayError> {
        let mut url = target.clone();

        if let Some(scheme) = req.upstream.scheme.as_deref() {
            url.set_scheme(scheme)
                .map_err(|_| GatewayError::upstream(format!("cannot switch upstream scheme to {}", scheme)))?;
        }

        let path_and_query = match &req.upstream.uri {
            Some(uri) => uri.as_str(),
            None => req.head.uri.path_and_query().map_or("/", |pq| pq.as_str()),
        };
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        url.set_path(path);
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    fn upstream_headers(&self, target: &Url, req: &GatewayRequest) -> HeaderMap {
        let mut headers = req.head.headers.clone();
        strip_hop_by_hop(&mut headers);

        let client_ip = req.remote_addr.ip().to_string();
        let forwarded_for = match req.header("x-forwarded-for") {
            Some(existing) if !existing.is_empty() => format!("{}, {}", existing, client_ip),
            _ => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
        headers.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if req.head.uri.scheme_str() == Some("https") {
                "https"
            } else {
                "http"
            }),
        );
        if let Some(host) = req.headers().get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }

        let node_host = || match (target.host_str(), target.port()) {
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            (Some(host), None) => Some(host.to_string()),
            _ => None,
        };
        let host = match (&req.upstream.host, self.options.pass_host) {
            (Some(host), _) => Some(host.clone()),
            (None, PassHost::Pass) => None,
            (None, PassHost::Node) => node_host(),
            (None, PassHost::Rewrite) => self.options.upstream_host.clone().or_else(node_host),
        };
        match host.map(|host| HeaderValue::from_str(&host)) {
            Some(Ok(value)) => {
                headers.insert(header::HOST, value);
            }
            Some(Err(e)) => warn!(error = %e, "Invalid upstream host header, keeping client host"),
            None => {}
        }

        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, self.transport.user_agent().clone());
        }

        headers
    }
}

/// Whether a failed exchange was caused by the inbound client going away
fn client_went_away(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = source {
        // inbound body errors surface wrapped in axum::Error
        if cause.downcast_ref::<axum::Error>().is_some() {
            return true;
        }
        if let Some(hyper_error) = cause.downcast_ref::<hyper::Error>() {
            if hyper_error.is_canceled() {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

fn map_upstream_error(error: reqwest::Error, read_timeout: Option<Duration>) -> GatewayError {
    if error.is_timeout() {
        return GatewayError::UpstreamTimeout {
            timeout_ms: read_timeout.map_or(0, |t| t.as_millis() as u64),
        };
    }
    if client_went_away(&error) {
        return GatewayError::ClientClosed {
            message: error.to_string(),
        };
    }
    GatewayError::upstream(error.to_string())
}

/// Stream an upstream body that must be complete by `deadline`
///
/// The status line is already on its way to the client, so a late body aborts the response
/// instead of turning into a 504.
fn bounded_body<S>(stream: S, deadline: tokio::time::Instant, upstream_id: String) -> Body
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let chunks = stream::unfold(Some(Box::pin(stream)), move |state| {
        let upstream_id = upstream_id.clone();
        async move {
            let mut stream = state?;
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(stream))),
                Ok(Some(Err(e))) => Some((Err(io::Error::new(io::ErrorKind::Other, e)), None)),
                Ok(None) => None,
                Err(_) => {
                    counter!("proxy_body_timeouts_total").increment(1);
                    warn!(upstream_id = %upstream_id, "Upstream body exceeded read timeout, aborting response");
                    let error = io::Error::new(io::ErrorKind::TimedOut, "upstream read timeout");
                    Some((Err(error), None))
                }
            }
        }
    });
    Body::from_stream(chunks)
}

#[async_trait]
impl Handler for ProxyHandler {
    async fn handle(&self, req: &mut GatewayRequest) -> Response {
        let target = self.balancer.next();
        let authority = match (target.host_str(), target.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            _ => target.to_string(),
        };
        req.vars.request.set("upstream_addr", authority.as_str());

        let result = self.forward(target, req).await;
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                counter!("proxy_errors_total", "type" => error.error_type()).increment(1);
                warn!(
                    upstream_id = %self.options.upstream_id,
                    upstream = %authority,
                    error = %error,
                    "Upstream exchange failed"
                );
                error.into_response()
            }
        };

        req.vars.request.set("status", response.status().as_u16());
        response
    }
}

impl ProxyHandler {
    async fn forward(&self, target: &Url, req: &mut GatewayRequest) -> Result<Response, GatewayError> {
        let url = self.upstream_url(target, req)?;
        let method = req
            .upstream
            .method
            .clone()
            .unwrap_or_else(|| req.head.method.clone());
        let headers = self.upstream_headers(target, req);
        let body = reqwest::Body::wrap_stream(req.take_body().into_data_stream());

        debug!(method = %method, url = %url, "Forwarding request upstream");

        let started = Instant::now();
        let deadline = self
            .options
            .read_timeout
            .map(|limit| tokio::time::Instant::now() + limit);
        let send = self
            .transport
            .client()
            .request(method, url)
            .headers(headers)
            .body(body)
            .send();

        let upstream_response = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, send)
                .await
                .map_err(|_| GatewayError::UpstreamTimeout {
                    timeout_ms: self.options.read_timeout.map_or(0, |t| t.as_millis() as u64),
                })?,
            None => send.await,
        }
        .map_err(|e| map_upstream_error(e, self.options.read_timeout))?;

        counter!("proxy_requests_total", "upstream" => self.options.upstream_id.clone()).increment(1);
        debug!(
            status = upstream_response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upstream responded"
        );

        let status = upstream_response.status();
        let mut headers = upstream_response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let body = match deadline {
            Some(deadline) => bounded_body(
                upstream_response.bytes_stream(),
                deadline,
                self.options.upstream_id.clone(),
            ),
            None => Body::from_stream(upstream_response.bytes_stream()),
        };

        let mut response = HttpResponse::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
