//! # Request Variables
//!
//! Per-request variable namespaces shared between chain stages.
//!
//! - [`GatewayVars`] holds the typed, set-once facts about a request: which route and service it
//!   matched and which consumer it authenticated as.
//! - [`RequestVars`] is the dynamic scratch bag one stage writes and a later stage reads, for
//!   example the upstream status recorded by the proxy and read by a logger.
//!
//! Both come from [`VarsPool`] and go back to it when the request's [`RequestVariables`] is
//! dropped. The pool wipes them on the way back, so no key survives into an unrelated request.

pub mod lookup;

use serde_json::Value;
use std::collections::HashMap;

use crate::core::pool::{ObjectPool, Pooled, Recycle};

pub use lookup::{is_transport_var, lookup};

/// Static-for-the-request facts, set near the start of the chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayVars {
    pub route_id: String,
    pub route_name: String,
    pub service_id: String,
    pub service_name: String,
    pub consumer_name: String,
    pub consumer_group_id: String,
    pub matched_uri: String,
}

impl GatewayVars {
    pub const NAMES: &'static [&'static str] = &[
        "route_id",
        "route_name",
        "service_id",
        "service_name",
        "consumer_name",
        "consumer_group_id",
        "matched_uri",
    ];

    fn slot(&self, name: &str) -> Option<&String> {
        match name {
            "route_id" => Some(&self.route_id),
            "route_name" => Some(&self.route_name),
            "service_id" => Some(&self.service_id),
            "service_name" => Some(&self.service_name),
            "consumer_name" => Some(&self.consumer_name),
            "consumer_group_id" => Some(&self.consumer_group_id),
            "matched_uri" => Some(&self.matched_uri),
            _ => None,
        }
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut String> {
        match name {
            "route_id" => Some(&mut self.route_id),
            "route_name" => Some(&mut self.route_name),
            "service_id" => Some(&mut self.service_id),
            "service_name" => Some(&mut self.service_name),
            "consumer_name" => Some(&mut self.consumer_name),
            "consumer_group_id" => Some(&mut self.consumer_group_id),
            "matched_uri" => Some(&mut self.matched_uri),
            _ => None,
        }
    }

    /// Value of a gateway variable; unset variables are absent
    pub fn get(&self, name: &str) -> Option<&str> {
        self.slot(name)
            .filter(|value| !value.is_empty())
            .map(String::as_str)
    }

    /// Set a gateway variable by name, returning `false` for names that are not gateway variables
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        match self.slot_mut(name) {
            Some(slot) => {
                slot.clear();
                slot.push_str(value);
                true
            }
            None => false,
        }
    }
}

impl Recycle for GatewayVars {
    fn recycle(&mut self) {
        // clear() keeps each String's allocation for the next request
        self.route_id.clear();
        self.route_name.clear();
        self.service_id.clear();
        self.service_name.clear();
        self.consumer_name.clear();
        self.consumer_group_id.clear();
        self.matched_uri.clear();
    }
}

/// Mutable scratch space scoped to one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestVars {
    entries: HashMap<String, Value>,
}

impl RequestVars {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Recycle for RequestVars {
    fn recycle(&mut self) {
        self.entries.clear();
    }
}

/// Both namespaces of one request; dropping it returns them to their pools
#[derive(Debug)]
pub struct RequestVariables {
    pub gateway: Pooled<GatewayVars>,
    pub request: Pooled<RequestVars>,
}

/// Pools for the two variable namespaces
#[derive(Debug, Clone)]
pub struct VarsPool {
    gateway: ObjectPool<GatewayVars>,
    request: ObjectPool<RequestVars>,
}

impl VarsPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            gateway: ObjectPool::new(GatewayVars::default, max_idle),
            request: ObjectPool::new(RequestVars::default, max_idle),
        }
    }

    /// Check out a fresh, empty pair of namespaces
    pub fn acquire(&self) -> RequestVariables {
        RequestVariables {
            gateway: self.gateway.acquire(),
            request: self.request.acquire(),
        }
    }

    pub fn idle(&self) -> usize {
        self.gateway.idle().min(self.request.idle())
    }
}

impl Default for VarsPool {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_released_namespaces_come_back_empty() {
        let pool = VarsPool::new(4);

        let mut vars = pool.acquire();
        vars.gateway.set("consumer_name", "jack");
        vars.request.set("status", 200);
        drop(vars);

        let vars = pool.acquire();
        assert_eq!(vars.gateway.get("consumer_name"), None);
        assert!(vars.request.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_gateway_vars_reject_unknown_names() {
        let mut vars = GatewayVars::default();
        assert!(vars.set("route_id", "r1"));
        assert!(!vars.set("status", "200"));
        assert_eq!(vars.get("route_id"), Some("r1"));
        assert_eq!(vars.get("route_name"), None);
    }

    #[test]
    fn test_request_vars_hold_json_values() {
        let mut vars = RequestVars::default();
        vars.set("status", 502);
        vars.set("tags", json!(["a"]));

        assert_eq!(vars.get("status"), Some(&json!(502)));
        assert_eq!(vars.remove("tags"), Some(json!(["a"])));
        assert_eq!(vars.len(), 1);
    }
}
