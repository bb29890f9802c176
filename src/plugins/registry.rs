//! Name-keyed plugin registry.
//!
//! Factories are registered once at startup; the route builder asks the registry for a blank
//! instance of each plugin a route names. The builder never refers to concrete plugin types.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{
    file_logger::FileLogger, http_logger::HttpLogger, key_auth::KeyAuth, mocking::Mocking,
    proxy_rewrite::ProxyRewrite, request_context::RequestContext, request_id::RequestId, Plugin,
    PluginContext,
};

/// Creates a blank plugin instance
pub type PluginFactory = Arc<dyn Fn(&PluginContext) -> Box<dyn Plugin> + Send + Sync>;

#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every plugin shipped with the gateway
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(RequestContext::NAME, |_| Box::new(RequestContext::default()));
        registry.register(RequestId::NAME, |_| Box::new(RequestId::default()));
        registry.register(Mocking::NAME, |_| Box::new(Mocking::default()));
        registry.register(KeyAuth::NAME, |ctx| Box::new(KeyAuth::new(Arc::clone(&ctx.store))));
        registry.register(ProxyRewrite::NAME, |_| Box::new(ProxyRewrite::default()));
        registry.register(FileLogger::NAME, |ctx| {
            Box::new(FileLogger::new(Arc::clone(&ctx.store)))
        });
        registry.register(HttpLogger::NAME, |ctx| {
            Box::new(HttpLogger::new(Arc::clone(&ctx.store), ctx.client.clone()))
        });
        debug!(plugins = registry.factories.len(), "Registered built-in plugins");
        registry
    }

    /// Register a factory under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginContext) -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// A blank instance of `name`, or `None` for unknown plugins
    pub fn create(&self, name: &str, ctx: &PluginContext) -> Option<Box<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory(ctx))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered plugin names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConfigStore;

    fn context() -> PluginContext {
        PluginContext::new(Arc::new(ConfigStore::open_in_memory()), reqwest::Client::new())
    }

    #[test]
    fn test_defaults_create_named_instances() {
        let registry = PluginRegistry::with_defaults();
        let ctx = context();

        for name in registry.names() {
            let plugin = registry.create(&name, &ctx).unwrap();
            assert_eq!(plugin.name(), name);
        }
        assert!(registry.contains("key-auth"));
        assert!(registry.create("no-such-plugin", &ctx).is_none());
    }

    #[test]
    fn test_priorities_of_shipped_plugins() {
        let registry = PluginRegistry::with_defaults();
        let ctx = context();
        let priority = |name: &str| registry.create(name, &ctx).unwrap().priority();

        assert!(priority("request-context") > priority("request-id"));
        assert!(priority("request-id") > priority("mocking"));
        assert!(priority("mocking") > priority("key-auth"));
        assert!(priority("key-auth") > priority("proxy-rewrite"));
        assert!(priority("http-logger") > priority("file-logger"));
    }
}
