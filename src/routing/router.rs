//! # Router Module
//!
//! The routing table maps (method, host, path) to the handler chain of one route. It is built in
//! full by the route builder and never mutated once it serves traffic.
//!
//! ## Pattern syntax
//!
//! - `/users/:id` captures one named path segment
//! - `/static/*` is an open prefix match on everything after `/static/`
//! - combining `:name` and `*` in one pattern is rejected
//!
//! Exact and parameterized patterns live in a radix tree (`matchit`). Prefix patterns are kept in a
//! list ordered by prefix length and only consulted when no radix pattern produced a candidate, so
//! the longest prefix wins.
//!
//! ## Rust Concepts Used
//!
//! - `matchit` stores an index into `slots`, the slot owns the candidates for one pattern
//! - `RouteMatch<'t>` borrows from the table, so a lookup allocates only the captured parameters

use axum::http::Method;
use matchit::Router as RadixRouter;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::warn;

use crate::core::error::{GatewayError, GatewayResult};
use crate::plugins::BoxHandler;

/// How a route URI is registered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathPattern {
    /// Exact or `:param` pattern, in radix-tree syntax
    Radix(String),
    /// Everything starting with this prefix
    Prefix(String),
}

/// Translate a route URI into a registrable pattern
pub fn convert_uri(uri: &str) -> GatewayResult<PathPattern> {
    let unsupported = || GatewayError::UnsupportedPattern {
        uri: uri.to_string(),
    };

    if !uri.starts_with('/') {
        return Err(unsupported());
    }

    match uri.find('*') {
        Some(position) => {
            if position != uri.len() - 1 || uri.contains(':') {
                return Err(unsupported());
            }
            Ok(PathPattern::Prefix(uri[..position].to_string()))
        }
        None => Ok(PathPattern::Radix(uri.to_string())),
    }
}

/// Route methods as typed methods; `None` means every method
fn parse_methods(route_id: &str, methods: &[String]) -> Option<HashSet<Method>> {
    if methods.is_empty() {
        return None;
    }

    let parsed = methods
        .iter()
        .filter_map(|raw| {
            let upper = raw.to_ascii_uppercase();
            if upper == "PURGE" {
                warn!(route_id = %route_id, "PURGE method is not supported, skipping it");
                return None;
            }
            match Method::from_str(&upper) {
                Ok(method) => Some(method),
                Err(e) => {
                    warn!(route_id = %route_id, method = %raw, error = %e, "Skipping invalid method");
                    None
                }
            }
        })
        .collect();
    Some(parsed)
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() + 1
            && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.',
        None => pattern.eq_ignore_ascii_case(host),
    }
}

/// A route registered under one pattern
struct Candidate {
    route_id: String,
    priority: i64,
    methods: Option<HashSet<Method>>,
    hosts: Vec<String>,
    handler: BoxHandler,
}

impl Candidate {
    fn accepts(&self, method: &Method, host: Option<&str>) -> bool {
        let method_ok = self
            .methods
            .as_ref()
            .map_or(true, |methods| methods.contains(method));
        let host_ok = self.hosts.is_empty()
            || host.map_or(false, |host| self.hosts.iter().any(|p| host_matches(p, host)));
        method_ok && host_ok
    }
}

/// Every candidate for one pattern, highest priority first
struct Slot {
    uri: String,
    candidates: Vec<Candidate>,
}

impl Slot {
    fn insert(&mut self, candidate: Candidate) {
        // after every candidate of equal or higher priority, keeping insertion order on ties
        let position = self
            .candidates
            .iter()
            .position(|existing| existing.priority < candidate.priority)
            .unwrap_or(self.candidates.len());
        self.candidates.insert(position, candidate);
    }

    fn select(&self, method: &Method, host: Option<&str>) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.accepts(method, host))
    }
}

/// Result of a successful lookup
pub struct RouteMatch<'t> {
    pub handler: &'t BoxHandler,
    pub route_id: &'t str,
    /// The route URI that matched, as configured
    pub matched_uri: &'t str,
    pub params: Vec<(String, String)>,
}

/// Registration parameters shared by every URI of one route
pub struct RouteRegistration<'a> {
    pub route_id: &'a str,
    pub methods: &'a [String],
    pub hosts: &'a [String],
    pub priority: i64,
    pub handler: BoxHandler,
}

/// Immutable once built; lookups take `&self` only
#[derive(Default)]
pub struct RoutingTable {
    radix: RadixRouter<usize>,
    slots: Vec<Slot>,
    by_pattern: HashMap<PathPattern, usize>,
    /// (prefix, slot index), longest prefix first
    prefixes: Vec<(String, usize)>,
    route_ids: HashSet<String>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("patterns", &self.slots.len())
            .field("routes", &self.route_ids.len())
            .finish()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one URI of a route
    ///
    /// Errors concern this URI only; the caller keeps registering the route's other URIs.
    pub fn insert(&mut self, uri: &str, registration: &RouteRegistration<'_>) -> GatewayResult<()> {
        let pattern = convert_uri(uri)?;

        let methods = parse_methods(registration.route_id, registration.methods);
        if methods.as_ref().map_or(false, HashSet::is_empty) {
            return Err(GatewayError::config(format!(
                "route '{}' has no supported method",
                registration.route_id
            )));
        }

        let slot = match self.by_pattern.get(&pattern) {
            Some(&slot) => slot,
            None => {
                let slot = self.slots.len();
                match &pattern {
                    PathPattern::Radix(path) => {
                        self.radix.insert(path.clone(), slot).map_err(|e| {
                            warn!(uri = %uri, error = %e, "Pattern conflicts with a registered pattern");
                            GatewayError::UnsupportedPattern {
                                uri: uri.to_string(),
                            }
                        })?;
                    }
                    PathPattern::Prefix(prefix) => {
                        let position = self
                            .prefixes
                            .iter()
                            .position(|(existing, _)| existing.len() < prefix.len())
                            .unwrap_or(self.prefixes.len());
                        self.prefixes.insert(position, (prefix.clone(), slot));
                    }
                }
                self.slots.push(Slot {
                    uri: uri.to_string(),
                    candidates: Vec::new(),
                });
                self.by_pattern.insert(pattern, slot);
                slot
            }
        };

        self.slots[slot].insert(Candidate {
            route_id: registration.route_id.to_string(),
            priority: registration.priority,
            methods,
            hosts: registration.hosts.to_vec(),
            handler: registration.handler.clone(),
        });
        self.route_ids.insert(registration.route_id.to_string());
        Ok(())
    }

    /// Find the handler for a request; `host` is expected without port
    pub fn lookup(&self, method: &Method, host: Option<&str>, path: &str) -> Option<RouteMatch<'_>> {
        if let Ok(found) = self.radix.at(path) {
            let slot = &self.slots[*found.value];
            if let Some(candidate) = slot.select(method, host) {
                return Some(RouteMatch {
                    handler: &candidate.handler,
                    route_id: &candidate.route_id,
                    matched_uri: &slot.uri,
                    params: found
                        .params
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                });
            }
        }

        self.prefixes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .find_map(|(_, slot)| {
                let slot = &self.slots[*slot];
                slot.select(method, host).map(|candidate| RouteMatch {
                    handler: &candidate.handler,
                    route_id: &candidate.route_id,
                    matched_uri: &slot.uri,
                    params: Vec::new(),
                })
            })
    }

    /// Number of distinct routes registered
    pub fn route_count(&self) -> usize {
        self.route_ids.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
