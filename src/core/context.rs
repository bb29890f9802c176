//! Process-wide services, created once at startup and passed explicitly to every component.

use std::sync::Arc;

use super::config::GatewaySettings;
use super::error::GatewayResult;
use crate::plugins::{PluginContext, PluginRegistry, SchemaValidator};
use crate::proxy::UpstreamTransport;
use crate::store::ConfigStore;
use crate::variables::VarsPool;

/// Shared state of one gateway instance
///
/// Tests build a fresh context per test instead of touching any global.
#[derive(Debug, Clone)]
pub struct GatewayContext {
    pub settings: Arc<GatewaySettings>,
    pub store: Arc<ConfigStore>,
    pub vars: VarsPool,
    pub registry: Arc<PluginRegistry>,
    pub transport: UpstreamTransport,
    pub schemas: Arc<SchemaValidator>,
}

impl GatewayContext {
    pub fn new(
        settings: GatewaySettings,
        store: Arc<ConfigStore>,
        registry: PluginRegistry,
    ) -> GatewayResult<Self> {
        let transport = UpstreamTransport::new(&settings.proxy)?;
        Ok(Self {
            settings: Arc::new(settings),
            store,
            vars: VarsPool::default(),
            registry: Arc::new(registry),
            transport,
            schemas: Arc::new(SchemaValidator::new()),
        })
    }

    /// Default settings, an in-memory store and the built-in plugins
    pub fn in_memory() -> GatewayResult<Self> {
        Self::new(
            GatewaySettings::default(),
            Arc::new(ConfigStore::open_in_memory()),
            PluginRegistry::with_defaults(),
        )
    }

    /// Services handed to plugin factories
    pub fn plugin_context(&self) -> PluginContext {
        PluginContext::new(Arc::clone(&self.store), self.transport.client().clone())
    }
}
