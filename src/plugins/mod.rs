//! # Plugin System
//!
//! A plugin is a named, priority-ordered request/response processor with a JSON-schema for its
//! configuration. The route builder takes every plugin a route uses through a fixed lifecycle:
//!
//! 1. the registry creates a blank instance by name ([`PluginRegistry::create`])
//! 2. [`Plugin::init`] runs before any configuration is known
//! 3. the raw config is validated against [`Plugin::schema`]
//! 4. [`Plugin::configure`] decodes the raw config into the plugin's typed config
//! 5. [`Plugin::post_init`] builds derived state that depends on the decoded values
//! 6. [`compose_chain`] wraps the terminal handler with every plugin's [`Plugin::handler`]
//!
//! ## Ordering
//!
//! Plugins are sorted by descending priority with a stable sort, then the terminal handler is
//! wrapped from the lowest priority to the highest. The highest-priority plugin is therefore the
//! outermost layer: its request-side logic runs first and its response-side logic runs last.

pub mod file_logger;
pub mod handler;
pub mod http_logger;
pub mod key_auth;
pub mod logger;
pub mod mocking;
pub mod proxy_rewrite;
pub mod registry;
pub mod request_context;
pub mod request_id;
pub mod schema;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::core::error::{GatewayError, GatewayResult};
use crate::store::ConfigStore;

pub use handler::{BoxHandler, GatewayRequest, Handler, UpstreamOverrides};
pub use registry::{PluginFactory, PluginRegistry};
pub use schema::SchemaValidator;

/// A request/response processing unit attached to routes
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher values run earlier on the way in and later on the way out
    fn priority(&self) -> i64;

    /// JSON-schema the raw configuration must satisfy
    fn schema(&self) -> Value;

    /// Runs once on a blank instance, before configuration
    fn init(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    /// Decode an already validated raw configuration into the typed config
    fn configure(&mut self, raw: Value) -> GatewayResult<()>;

    /// Finalize state that depends on the decoded configuration
    fn post_init(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    /// Wrap the next stage of the chain
    fn handler(self: Arc<Self>, next: BoxHandler) -> BoxHandler;
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name())
            .field("priority", &self.priority())
            .finish()
    }
}

/// Shared services a plugin factory may hand to the plugin it creates
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub store: Arc<ConfigStore>,
    /// Outbound client for plugins that talk to external services
    pub client: reqwest::Client,
}

impl PluginContext {
    pub fn new(store: Arc<ConfigStore>, client: reqwest::Client) -> Self {
        Self { store, client }
    }
}

/// Compose `plugins` around `terminal`, highest priority outermost
///
/// Plugins with equal priority keep their input order.
pub fn compose_chain(mut plugins: Vec<Arc<dyn Plugin>>, terminal: BoxHandler) -> BoxHandler {
    plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));

    plugins
        .into_iter()
        .rev()
        .fold(terminal, |next, plugin| plugin.handler(next))
}

/// Decode a plugin config, attributing failures to the plugin
pub fn decode_config<T: DeserializeOwned>(plugin: &str, raw: Value) -> GatewayResult<T> {
    serde_json::from_value(raw)
        .map_err(|e| GatewayError::plugin(plugin, format!("invalid configuration: {}", e)))
}

/// `{"message": ...}` JSON response used by plugins that answer on their own
pub fn message_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "message": message }))).into_response()
}
