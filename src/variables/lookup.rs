//! Resolution of `$name` variable references.
//!
//! Lookup order:
//! 1. transport variables, computed from the live request on every call and never stored
//! 2. gateway variables
//! 3. request-scoped variables
//!
//! A transport name is answered by the transport family alone. Anything unresolved is `None`.

use serde_json::Value;

use crate::plugins::GatewayRequest;

const TRANSPORT_VARS: &[&str] = &[
    "request_method",
    "request_uri",
    "uri",
    "args",
    "query_string",
    "remote_addr",
    "remote_port",
    "host",
    "scheme",
    "server_protocol",
    "content_length",
    "content_type",
    "time_iso8601",
    "msec",
];

/// Whether `name` belongs to the transport family (`http_*` headers and `arg_*` query params included)
pub fn is_transport_var(name: &str) -> bool {
    TRANSPORT_VARS.contains(&name) || name.starts_with("http_") || name.starts_with("arg_")
}

/// Resolve a variable by name; a leading `$` is accepted and ignored
pub fn lookup(req: &GatewayRequest, name: &str) -> Option<Value> {
    let name = name.strip_prefix('$').unwrap_or(name);

    if is_transport_var(name) {
        return transport(req, name);
    }

    if let Some(value) = req.vars.gateway.get(name) {
        return Some(Value::String(value.to_string()));
    }

    req.vars.request.get(name).cloned()
}

fn transport(req: &GatewayRequest, name: &str) -> Option<Value> {
    let head = &req.head;
    let text = |value: &str| Some(Value::String(value.to_string()));

    match name {
        "request_method" => text(head.method.as_str()),
        "request_uri" => text(head.uri.path_and_query().map_or("/", |pq| pq.as_str())),
        "uri" => text(head.uri.path()),
        "args" | "query_string" => head.uri.query().and_then(text),
        "remote_addr" => text(&req.remote_addr.ip().to_string()),
        "remote_port" => Some(Value::from(req.remote_addr.port())),
        "host" => req.host().and_then(text),
        "scheme" => text(head.uri.scheme_str().unwrap_or("http")),
        "server_protocol" => text(&format!("{:?}", head.version)),
        "content_length" => req.header("content-length").and_then(text),
        "content_type" => req.header("content-type").and_then(text),
        "time_iso8601" => text(&chrono::Utc::now().to_rfc3339()),
        "msec" => Some(Value::from(chrono::Utc::now().timestamp_millis())),
        _ => {
            if let Some(header) = name.strip_prefix("http_") {
                req.header(&header.replace('_', "-")).and_then(text)
            } else if let Some(arg) = name.strip_prefix("arg_") {
                req.query_param(arg).map(Value::String)
            } else {
                None
            }
        }
    }
}
