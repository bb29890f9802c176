//! Secondary index from `plugin:credential` to consumer ID.
//!
//! Auth plugins resolve a presented credential to its consumer with one map lookup. The index is
//! part of the store state and changes in the same transaction as the `consumers` bucket.

use crate::core::types::Consumer;
use std::collections::HashMap;

/// Credential field indexed for each auth-capable plugin
const INDEXED_CREDENTIALS: &[(&str, &str)] = &[("key-auth", "key"), ("basic-auth", "username")];

#[derive(Debug, Clone, Default)]
pub struct ConsumerIndex {
    by_key: HashMap<String, String>,
    by_consumer: HashMap<String, Vec<String>>,
}

impl ConsumerIndex {
    pub fn index_key(plugin: &str, credential: &str) -> String {
        format!("{}:{}", plugin, credential)
    }

    /// Index keys a consumer owns given its current plugin configs
    pub fn derive_keys(consumer: &Consumer) -> Vec<String> {
        INDEXED_CREDENTIALS
            .iter()
            .filter_map(|(plugin, field)| {
                let credential = consumer.plugins.get(*plugin)?.get(*field)?.as_str()?;
                if credential.is_empty() {
                    return None;
                }
                Some(Self::index_key(plugin, credential))
            })
            .collect()
    }

    /// Replace every entry owned by `consumer_id` with the keys derived from `consumer`
    pub fn upsert(&mut self, consumer_id: &str, consumer: &Consumer) {
        self.remove(consumer_id);

        let keys = Self::derive_keys(consumer);
        for key in &keys {
            if let Some(previous) = self.by_key.insert(key.clone(), consumer_id.to_string()) {
                if previous != consumer_id {
                    tracing::warn!(
                        key = %key,
                        previous_consumer = %previous,
                        consumer = %consumer_id,
                        "Credential already indexed for another consumer, overriding"
                    );
                    if let Some(owned) = self.by_consumer.get_mut(&previous) {
                        owned.retain(|owned_key| owned_key != key);
                    }
                }
            }
        }

        if !keys.is_empty() {
            self.by_consumer.insert(consumer_id.to_string(), keys);
        }
    }

    /// Remove every entry owned by `consumer_id`
    pub fn remove(&mut self, consumer_id: &str) {
        if let Some(keys) = self.by_consumer.remove(consumer_id) {
            for key in keys {
                if self.by_key.get(&key).map(String::as_str) == Some(consumer_id) {
                    self.by_key.remove(&key);
                }
            }
        }
    }

    pub fn lookup(&self, plugin: &str, credential: &str) -> Option<&str> {
        self.by_key
            .get(&Self::index_key(plugin, credential))
            .map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_consumer.clear();
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn consumer(plugins: serde_json::Value) -> Consumer {
        serde_json::from_value(json!({"username": "jack", "plugins": plugins})).unwrap()
    }

    #[test]
    fn test_derive_keys_for_auth_plugins() {
        let consumer = consumer(json!({
            "key-auth": {"key": "auth-one"},
            "basic-auth": {"username": "jack", "password": "x"},
            "limit-count": {"count": 2}
        }));

        let mut keys = ConsumerIndex::derive_keys(&consumer);
        keys.sort();
        assert_eq!(keys, vec!["basic-auth:jack", "key-auth:auth-one"]);
    }

    #[test]
    fn test_upsert_clears_old_entries_first() {
        let mut index = ConsumerIndex::default();
        index.upsert("jack", &consumer(json!({"key-auth": {"key": "old"}})));
        index.upsert("jack", &consumer(json!({"key-auth": {"key": "new"}})));

        assert_eq!(index.lookup("key-auth", "old"), None);
        assert_eq!(index.lookup("key-auth", "new"), Some("jack"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_drops_all_owned_entries() {
        let mut index = ConsumerIndex::default();
        index.upsert(
            "jack",
            &consumer(json!({"key-auth": {"key": "k"}, "basic-auth": {"username": "jack"}})),
        );
        index.remove("jack");

        assert!(index.is_empty());
        assert_eq!(index.lookup("basic-auth", "jack"), None);
    }
}
