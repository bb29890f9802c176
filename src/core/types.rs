//! # Resource Types
//!
//! Configuration objects mirrored from the coordination store. They are stored as opaque bytes in
//! the config store and decoded on demand with serde; unknown fields are ignored so newer control
//! planes can add attributes without breaking the data plane.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Raw, untyped plugin configuration as found in a resource's `plugins` map
pub type PluginConfigs = BTreeMap<String, serde_json::Value>;

/// A rule mapping method/path/host to a plugin chain and an upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Route {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    pub plugins: PluginConfigs,
    pub priority: i64,
    pub name: String,
    pub desc: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_id_ref"
    )]
    pub service_id: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_id_ref"
    )]
    pub upstream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    /// `0` disables the route, absent or `1` enables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_time: Option<i64>,
}

impl Route {
    /// All URI patterns of the route; a single `uri` is folded into the `uris` list
    pub fn all_uris(&self) -> Vec<String> {
        let mut uris = self.uris.clone();
        if let Some(uri) = self.uri.as_deref().filter(|uri| !uri.is_empty()) {
            if !uris.iter().any(|existing| existing == uri) {
                uris.push(uri.to_string());
            }
        }
        uris
    }

    pub fn is_enabled(&self) -> bool {
        self.status != Some(0)
    }

    pub fn service_ref(&self) -> Option<&str> {
        non_empty(&self.service_id)
    }

    pub fn upstream_ref(&self) -> Option<&str> {
        non_empty(&self.upstream_id)
    }

    /// The inline upstream, if it actually declares nodes
    pub fn inline_upstream(&self) -> Option<&Upstream> {
        self.upstream.as_ref().filter(|upstream| !upstream.nodes.is_empty())
    }
}

/// A reusable bundle of plugin config and upstream reference
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub name: String,
    pub desc: String,
    pub plugins: PluginConfigs,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_id_ref"
    )]
    pub upstream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
}

impl Service {
    pub fn upstream_ref(&self) -> Option<&str> {
        non_empty(&self.upstream_id)
    }

    pub fn inline_upstream(&self) -> Option<&Upstream> {
        self.upstream.as_ref().filter(|upstream| !upstream.nodes.is_empty())
    }
}

/// How the `Host` header is chosen when forwarding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassHost {
    /// Keep the client's host header
    #[default]
    Pass,
    /// Use the selected node's `host:port`
    Node,
    /// Use the configured `upstream_host`
    Rewrite,
}

/// Upstream timeouts in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamTimeout {
    pub connect: f64,
    pub send: f64,
    pub read: f64,
}

/// A weighted set of backend network targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Upstream {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub name: String,
    pub desc: String,
    #[serde(rename = "type")]
    pub lb_type: String,
    #[serde(deserialize_with = "deserialize_nodes")]
    pub nodes: Vec<Node>,
    pub scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<UpstreamTimeout>,
    pub pass_host: PassHost,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_host: Option<String>,
}

impl Upstream {
    /// Scheme used to talk to the nodes, `http` when unset
    pub fn scheme(&self) -> &str {
        if self.scheme.is_empty() {
            "http"
        } else {
            &self.scheme
        }
    }
}

/// One backend target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: i32,
}

fn default_weight() -> u32 {
    1
}

/// Upstream nodes come either as a list of objects or as a `{"host:port": weight}` map
fn deserialize_nodes<'de, D>(deserializer: D) -> Result<Vec<Node>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NodesRepr {
        List(Vec<Node>),
        Map(BTreeMap<String, u32>),
    }

    match NodesRepr::deserialize(deserializer)? {
        NodesRepr::List(nodes) => Ok(nodes),
        NodesRepr::Map(map) => map
            .into_iter()
            .map(|(address, weight)| {
                let (host, port) = address.rsplit_once(':').ok_or_else(|| {
                    serde::de::Error::custom(format!("node '{}' is missing a port", address))
                })?;
                let port = port.parse::<u16>().map_err(|e| {
                    serde::de::Error::custom(format!("node '{}' has invalid port: {}", address, e))
                })?;
                Ok(Node {
                    host: host.to_string(),
                    port,
                    weight,
                    priority: 0,
                })
            })
            .collect(),
    }
}

/// Resource IDs may be written as strings or integers
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(u64),
}

impl From<IdRepr> for String {
    fn from(id: IdRepr) -> Self {
        match id {
            IdRepr::Text(id) => id,
            IdRepr::Number(id) => id.to_string(),
        }
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IdRepr::deserialize(deserializer).map(String::from)
}

fn deserialize_id_ref<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<IdRepr>::deserialize(deserializer)?.map(String::from))
}

/// A client identity carrying credentials for authentication plugins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Consumer {
    pub username: String,
    pub desc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub plugins: PluginConfigs,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_folds_single_uri() {
        let route: Route = serde_json::from_value(json!({
            "id": "1",
            "uri": "/get",
            "uris": ["/a"],
        }))
        .unwrap();
        assert_eq!(route.all_uris(), vec!["/a".to_string(), "/get".to_string()]);
        assert!(route.is_enabled());
    }

    #[test]
    fn test_upstream_nodes_map_form() {
        let upstream: Upstream = serde_json::from_value(json!({
            "nodes": {"127.0.0.1:8080": 3, "backend.local:80": 1}
        }))
        .unwrap();
        assert_eq!(upstream.nodes.len(), 2);
        assert_eq!(upstream.scheme(), "http");
        assert!(upstream
            .nodes
            .iter()
            .any(|n| n.host == "127.0.0.1" && n.port == 8080 && n.weight == 3));
    }

    #[test]
    fn test_upstream_nodes_list_form_defaults_weight() {
        let upstream: Upstream = serde_json::from_value(json!({
            "scheme": "https",
            "nodes": [{"host": "httpbin.org", "port": 443}]
        }))
        .unwrap();
        assert_eq!(upstream.nodes[0].weight, 1);
        assert_eq!(upstream.scheme(), "https");
    }

    #[test]
    fn test_invalid_node_address_is_decode_error() {
        let result = serde_json::from_value::<Upstream>(json!({"nodes": {"no-port": 1}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_numeric_ids_are_accepted() {
        let route: Route = serde_json::from_value(json!({
            "id": 7,
            "uri": "/x",
            "service_id": 3,
            "upstream_id": "u1"
        }))
        .unwrap();
        assert_eq!(route.id, "7");
        assert_eq!(route.service_ref(), Some("3"));
        assert_eq!(route.upstream_ref(), Some("u1"));
    }

    #[test]
    fn test_empty_references_are_ignored() {
        let route: Route = serde_json::from_value(json!({
            "uri": "/x",
            "service_id": "",
            "upstream_id": "",
            "upstream": {"nodes": []}
        }))
        .unwrap();
        assert!(route.service_ref().is_none());
        assert!(route.upstream_ref().is_none());
        assert!(route.inline_upstream().is_none());
    }
}
