//! Connection-pooled outbound HTTP client shared by every route.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use tracing::info;

use crate::core::config::ProxySettings;
use crate::core::error::{GatewayError, GatewayResult};

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct UpstreamTransport {
    client: reqwest::Client,
    user_agent: HeaderValue,
}

impl UpstreamTransport {
    pub fn new(settings: &ProxySettings) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            // dialing includes the TLS handshake for https upstreams
            .connect_timeout(settings.dial_timeout + settings.tls_handshake_timeout)
            .pool_idle_timeout(settings.idle_conn_timeout)
            .pool_max_idle_per_host(settings.max_idle_conns_per_host)
            .tcp_keepalive(settings.keepalive)
            .danger_accept_invalid_certs(settings.insecure_skip_verify)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build upstream client: {}", e)))?;

        let user_agent = HeaderValue::from_str(&settings.user_agent)
            .map_err(|e| GatewayError::config(format!("Invalid proxy.user_agent: {}", e)))?;

        info!(
            dial_timeout = ?settings.dial_timeout,
            idle_conn_timeout = ?settings.idle_conn_timeout,
            max_idle_conns_per_host = settings.max_idle_conns_per_host,
            "Upstream transport ready"
        );

        Ok(Self { client, user_agent })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
