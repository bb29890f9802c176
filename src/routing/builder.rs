//! # Route Builder
//!
//! Turns the stored resources into an executable [`RoutingTable`]. Every build starts from one
//! consistent store snapshot and produces a complete new table; nothing is patched incrementally.
//!
//! Per route:
//!
//! 1. the referenced service is fetched and its plugins are merged below the route's own
//! 2. the effective upstream is resolved: route inline, route `upstream_id`, service inline,
//!    service `upstream_id`; the first one present wins
//! 3. the `request-context` plugin is injected with the route and service identity
//! 4. every plugin goes through create, init, schema validation, configure and post-init
//! 5. the plugins are composed around a proxy handler bound to the upstream's balancer
//! 6. each URI is registered in the table
//!
//! A route that fails is skipped and logged. A plugin that fails is dropped from its route and
//! logged. A URI that cannot be registered is skipped while the route's other URIs still register.

use metrics::counter;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::router::{RouteRegistration, RoutingTable};
use crate::core::context::GatewayContext;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{PluginConfigs, Route, Service, Upstream};
use crate::load_balancing::build_balancer;
use crate::plugins::request_context::RequestContext;
use crate::plugins::{compose_chain, BoxHandler, Plugin, PluginContext};
use crate::proxy::{ForwardOptions, ProxyHandler};
use crate::store::StoreSnapshot;

/// Builds routing tables from the config store
#[derive(Debug, Clone)]
pub struct RouteBuilder {
    ctx: GatewayContext,
}

impl RouteBuilder {
    pub fn new(ctx: GatewayContext) -> Self {
        Self { ctx }
    }

    /// Build a complete table from the current store contents
    pub fn build(&self) -> RoutingTable {
        let snapshot = self.ctx.store.snapshot();
        let plugin_ctx = self.ctx.plugin_context();
        let mut table = RoutingTable::new();
        let mut skipped = 0usize;

        for route in snapshot.list_routes() {
            if !route.is_enabled() {
                debug!(route_id = %route.id, "Route is disabled, not registering it");
                continue;
            }

            match self.build_route(&snapshot, &plugin_ctx, &route) {
                Ok((handler, hosts)) => register_route(&mut table, &route, &hosts, handler),
                Err(e) => {
                    skipped += 1;
                    counter!("route_build_failures_total").increment(1);
                    warn!(route_id = %route.id, error = %e, "Skipping route that failed to build");
                }
            }
        }

        info!(
            routes = table.route_count(),
            patterns = table.pattern_count(),
            skipped,
            "Routing table built"
        );
        table
    }

    /// Handler chain of one route and the hosts it answers for
    fn build_route(
        &self,
        snapshot: &StoreSnapshot,
        plugin_ctx: &PluginContext,
        route: &Route,
    ) -> GatewayResult<(BoxHandler, Vec<String>)> {
        let service = route
            .service_ref()
            .map(|id| snapshot.get_service(id))
            .transpose()?;

        let upstream = resolve_upstream(snapshot, route, service.as_ref())?;
        let balancer = build_balancer(&upstream)?;

        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        let identity = identity_config(route, service.as_ref());
        if let Some(plugin) = self.instantiate(RequestContext::NAME, identity, plugin_ctx, &route.id) {
            plugins.push(plugin);
        }

        for (name, raw) in merge_plugins(route, service.as_ref()) {
            if name == RequestContext::NAME {
                warn!(route_id = %route.id, "request-context is managed by the gateway, ignoring it");
                continue;
            }
            if is_disabled(&raw) {
                debug!(route_id = %route.id, plugin = %name, "Plugin disabled by _meta");
                continue;
            }
            if let Some(plugin) = self.instantiate(&name, strip_meta(raw), plugin_ctx, &route.id) {
                plugins.push(plugin);
            }
        }

        debug!(
            route_id = %route.id,
            upstream_id = %upstream.id,
            plugins = plugins.len(),
            balancer = balancer.algorithm_name(),
            "Route built"
        );

        let terminal: BoxHandler = Arc::new(ProxyHandler::new(
            balancer,
            self.ctx.transport.clone(),
            ForwardOptions::from_upstream(&upstream),
        ));

        let hosts = match &service {
            Some(service) if route.hosts.is_empty() => service.hosts.clone(),
            _ => route.hosts.clone(),
        };
        Ok((compose_chain(plugins, terminal), hosts))
    }

    /// Create and configure one plugin; failures drop only this plugin
    fn instantiate(
        &self,
        name: &str,
        raw: Value,
        plugin_ctx: &PluginContext,
        route_id: &str,
    ) -> Option<Arc<dyn Plugin>> {
        let Some(mut plugin) = self.ctx.registry.create(name, plugin_ctx) else {
            warn!(route_id = %route_id, plugin = %name, "Unknown plugin, skipping it");
            return None;
        };

        match self.prepare(plugin.as_mut(), raw) {
            Ok(()) => Some(Arc::from(plugin)),
            Err(e) => {
                counter!("plugin_init_failures_total", "plugin" => name.to_string()).increment(1);
                warn!(route_id = %route_id, plugin = %name, error = %e, "Skipping plugin");
                None
            }
        }
    }

    fn prepare(&self, plugin: &mut dyn Plugin, raw: Value) -> GatewayResult<()> {
        plugin.init()?;
        self.ctx
            .schemas
            .validate(plugin.name(), &plugin.schema(), &raw)?;
        plugin.configure(raw)?;
        plugin.post_init()
    }
}

fn register_route(table: &mut RoutingTable, route: &Route, hosts: &[String], handler: BoxHandler) {
    let uris = route.all_uris();
    if uris.is_empty() {
        warn!(route_id = %route.id, "Route has no uri, not registering it");
        return;
    }

    let registration = RouteRegistration {
        route_id: &route.id,
        methods: &route.methods,
        hosts,
        priority: route.priority,
        handler,
    };
    for uri in &uris {
        if let Err(e) = table.insert(uri, &registration) {
            warn!(route_id = %route.id, uri = %uri, error = %e, "Skipping uri");
        }
    }
}

/// First upstream found in precedence order
fn resolve_upstream(
    snapshot: &StoreSnapshot,
    route: &Route,
    service: Option<&Service>,
) -> GatewayResult<Upstream> {
    if let Some(upstream) = route.inline_upstream() {
        return Ok(with_fallback_id(upstream, || format!("route/{}", route.id)));
    }
    if let Some(id) = route.upstream_ref() {
        return snapshot.get_upstream(id);
    }

    if let Some(service) = service {
        if let Some(upstream) = service.inline_upstream() {
            return Ok(with_fallback_id(upstream, || format!("service/{}", service.id)));
        }
        if let Some(id) = service.upstream_ref() {
            return snapshot.get_upstream(id);
        }
    }

    Err(GatewayError::config(format!(
        "route '{}' has no upstream and no service providing one",
        route.id
    )))
}

fn with_fallback_id(upstream: &Upstream, id: impl FnOnce() -> String) -> Upstream {
    let mut upstream = upstream.clone();
    if upstream.id.is_empty() {
        upstream.id = id();
    }
    upstream
}

/// Route plugins, plus service plugins the route does not configure itself
fn merge_plugins(route: &Route, service: Option<&Service>) -> PluginConfigs {
    let mut plugins = route.plugins.clone();
    if let Some(service) = service {
        for (name, config) in &service.plugins {
            plugins
                .entry(name.clone())
                .or_insert_with(|| config.clone());
        }
    }
    plugins
}

fn identity_config(route: &Route, service: Option<&Service>) -> Value {
    json!({
        "route_id": route.id,
        "route_name": route.name,
        "service_id": service.map(|s| s.id.as_str()).unwrap_or_default(),
        "service_name": service.map(|s| s.name.as_str()).unwrap_or_default(),
    })
}

fn is_disabled(raw: &Value) -> bool {
    raw.pointer("/_meta/disable")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// `_meta` is gateway bookkeeping, never part of a plugin's own schema
fn strip_meta(mut raw: Value) -> Value {
    if let Some(object) = raw.as_object_mut() {
        object.remove("_meta");
    }
    raw
}
