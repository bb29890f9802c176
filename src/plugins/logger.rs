//! # Asynchronous Log Sinks
//!
//! Shared machinery for logging plugins. The request path renders a structured entry after the
//! inner chain returned and hands it to a bounded channel; a dedicated task drains the channel
//! into the sink. When the channel is full the configured [`DeliveryPolicy`] decides between
//! waiting for space and dropping the entry. Dropping never fails the request.

use async_trait::async_trait;
use axum::response::Response;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::{BoxHandler, GatewayRequest, Handler};
use crate::core::error::{GatewayError, GatewayResult};
use crate::store::ConfigStore;
use crate::variables::lookup;

/// Output field name to `$variable` reference or literal text
pub type LogFormat = BTreeMap<String, String>;

/// What to do when the sink channel is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    /// Wait for space, delaying the response
    Block,
    /// Discard the entry
    #[default]
    Drop,
}

/// Options shared by every logging plugin, flattened into their configs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,
    #[serde(default)]
    pub policy: DeliveryPolicy,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            log_format: None,
            policy: DeliveryPolicy::default(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_buffer_size() -> usize {
    1024
}

/// Schema properties for [`SinkOptions`], merged into each logger's schema
pub fn sink_schema_properties() -> Map<String, Value> {
    let properties = json!({
        "log_format": {
            "type": "object",
            "additionalProperties": {"type": "string"}
        },
        "policy": {"type": "string", "enum": ["block", "drop"]},
        "buffer_size": {"type": "integer", "minimum": 1}
    });
    match properties {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn default_log_format() -> LogFormat {
    [
        ("time", "$time_iso8601"),
        ("client_ip", "$remote_addr"),
        ("host", "$host"),
        ("method", "$request_method"),
        ("uri", "$request_uri"),
        ("status", "$status"),
        ("latency_ms", "$latency"),
        ("route_id", "$route_id"),
        ("service_id", "$service_id"),
        ("consumer", "$consumer_name"),
        ("upstream", "$upstream_addr"),
        ("request_id", "$request_id"),
    ]
    .into_iter()
    .map(|(field, value)| (field.to_string(), value.to_string()))
    .collect()
}

/// Log format for `plugin`: its own config first, then its plugin metadata, then the default
pub fn resolve_log_format(configured: Option<&LogFormat>, store: &ConfigStore, plugin: &str) -> LogFormat {
    if let Some(format) = configured.filter(|format| !format.is_empty()) {
        return format.clone();
    }

    let from_metadata = store
        .plugin_metadata(plugin)
        .and_then(|metadata| metadata.get("log_format").cloned())
        .and_then(|format| match serde_json::from_value::<LogFormat>(format) {
            Ok(format) => Some(format),
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "Ignoring invalid log_format in plugin metadata");
                None
            }
        });

    from_metadata.unwrap_or_else(default_log_format)
}

/// Build an entry from `format`; `$name` values are looked up, anything else is literal text
pub fn render(format: &LogFormat, req: &GatewayRequest) -> Value {
    let entry = format
        .iter()
        .map(|(field, template)| {
            let value = if template.starts_with('$') {
                lookup(req, template).unwrap_or(Value::Null)
            } else {
                Value::String(template.clone())
            };
            (field.clone(), value)
        })
        .collect::<Map<_, _>>();
    Value::Object(entry)
}

/// Destination of rendered entries
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn write(&self, entry: &Value) -> GatewayResult<()>;
}

/// Bounded queue in front of a [`LogSink`] drained by its own task
#[derive(Debug)]
pub struct AsyncLogger {
    plugin: &'static str,
    sender: mpsc::Sender<Value>,
    policy: DeliveryPolicy,
}

impl AsyncLogger {
    /// Start the consumer task; it stops once every sender is gone
    pub fn spawn<S: LogSink>(
        plugin: &'static str,
        sink: S,
        capacity: usize,
        policy: DeliveryPolicy,
    ) -> GatewayResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            GatewayError::plugin(plugin, format!("logger needs a tokio runtime: {}", e))
        })?;

        let (sender, mut receiver) = mpsc::channel::<Value>(capacity.max(1));
        runtime.spawn(async move {
            while let Some(entry) = receiver.recv().await {
                if let Err(e) = sink.write(&entry).await {
                    warn!(plugin = %plugin, error = %e, "Failed to write log entry");
                    counter!("logger_write_errors_total", "plugin" => plugin).increment(1);
                }
            }
            debug!(plugin = %plugin, "Log sink stopped");
        });

        Ok(Self {
            plugin,
            sender,
            policy,
        })
    }

    /// Queue an entry according to the delivery policy
    pub async fn submit(&self, entry: Value) {
        match self.sender.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => match self.policy {
                DeliveryPolicy::Block => {
                    if self.sender.send(entry).await.is_err() {
                        warn!(plugin = %self.plugin, "Log sink closed, entry lost");
                    }
                }
                DeliveryPolicy::Drop => {
                    debug!(plugin = %self.plugin, "Log sink full, dropping entry");
                    counter!("logger_entries_dropped_total", "plugin" => self.plugin).increment(1);
                }
            },
            Err(TrySendError::Closed(_)) => {
                warn!(plugin = %self.plugin, "Log sink closed, entry lost");
            }
        }
    }
}

/// Chain stage rendering one entry per request after the inner chain returned
pub struct LoggerLayer {
    pub logger: Arc<AsyncLogger>,
    pub format: Arc<LogFormat>,
    pub next: BoxHandler,
}

#[async_trait]
impl Handler for LoggerLayer {
    async fn handle(&self, req: &mut GatewayRequest) -> Response {
        let started = Instant::now();
        let response = self.next.handle(req).await;

        if req.vars.request.get("status").is_none() {
            req.vars.request.set("status", response.status().as_u16());
        }
        req.vars
            .request
            .set("latency", started.elapsed().as_secs_f64() * 1000.0);

        let entry = render(&self.format, req);
        self.logger.submit(entry).await;
        response
    }
}
