//! Standalone feed backed by a local resource file.
//!
//! The file lists resources per bucket:
//!
//! ```yaml
//! routes:
//!   - id: "1"
//!     uri: /get
//!     upstream:
//!       nodes:
//!         "127.0.0.1:8080": 1
//! consumers:
//!   - username: jack
//!     plugins:
//!       key-auth:
//!         key: secret
//! ```
//!
//! Consumers are identified by `username`, every other resource by `id`. The file is watched with
//! `notify`; on change it is re-read and diffed against the last snapshot, producing puts for new or
//! changed resources and deletes for removed ones.

use async_trait::async_trait;
use notify::{recommended_watcher, Event as FsEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ConfigFeed;
use crate::core::error::{GatewayError, GatewayResult};
use crate::store::{Event, EventPool, EventType, PooledEvent, BUCKETS, CONSUMERS};

/// Resource key to serialized resource
type Snapshot = BTreeMap<String, Vec<u8>>;

/// Settle time after a file change before re-reading it
const SETTLE_DELAY: Duration = Duration::from_millis(100);

pub struct StandaloneFeed {
    path: PathBuf,
    prefix: String,
    last: Mutex<Snapshot>,
}

impl StandaloneFeed {
    pub fn new<P: Into<PathBuf>>(path: P, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
            last: Mutex::new(Snapshot::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and flatten the resource file into `key -> value`
    async fn read_snapshot(&self) -> GatewayResult<Snapshot> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GatewayError::config(format!(
                "Failed to read resource file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let document: Value = if self.path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        self.flatten(document)
    }

    fn flatten(&self, document: Value) -> GatewayResult<Snapshot> {
        let sections = match document {
            Value::Null => return Ok(Snapshot::new()),
            Value::Object(sections) => sections,
            _ => {
                return Err(GatewayError::config(
                    "Resource file must be a mapping of bucket name to resource list",
                ))
            }
        };

        let mut snapshot = Snapshot::new();
        for (bucket, resources) in sections {
            if !BUCKETS.contains(&bucket.as_str()) {
                warn!(bucket = %bucket, "Ignoring unknown section in resource file");
                continue;
            }

            let Value::Array(resources) = resources else {
                warn!(bucket = %bucket, "Resource file section is not a list, ignoring");
                continue;
            };

            for resource in resources {
                let Some(id) = resource_id(&bucket, &resource) else {
                    warn!(bucket = %bucket, "Resource without an id in resource file, ignoring");
                    continue;
                };
                let key = format!("{}/{}/{}", self.prefix, bucket, id);
                snapshot.insert(key, serde_json::to_vec(&resource)?);
            }
        }

        Ok(snapshot)
    }

    /// Events turning `old` into `new`, put events first, each group in key order
    fn diff(old: &Snapshot, new: &Snapshot, pool: &EventPool) -> Vec<PooledEvent> {
        let mut events = Vec::new();

        for (key, value) in new {
            if old.get(key) != Some(value) {
                let mut event = pool.acquire();
                event.fill(EventType::Put, key.as_bytes(), value);
                events.push(event);
            }
        }

        for key in old.keys().filter(|key| !new.contains_key(*key)) {
            let mut event = pool.acquire();
            event.fill(EventType::Delete, key.as_bytes(), &[]);
            events.push(event);
        }

        events
    }

    async fn reload(&self, pool: &EventPool, sender: &mpsc::Sender<PooledEvent>) -> bool {
        let next = match self.read_snapshot().await {
            Ok(next) => next,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Keeping previous resources, reload failed");
                return true;
            }
        };

        let events = {
            let mut last = self.last.lock();
            let events = Self::diff(&last, &next, pool);
            *last = next;
            events
        };

        if events.is_empty() {
            debug!(path = %self.path.display(), "Resource file changed without resource changes");
            return true;
        }

        info!(path = %self.path.display(), changes = events.len(), "Resource file changed");
        for event in events {
            if sender.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}

fn resource_id(bucket: &str, resource: &Value) -> Option<String> {
    let field = if bucket == CONSUMERS { "username" } else { "id" };
    match resource.get(field)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ConfigFeed for StandaloneFeed {
    async fn fetch_all(&self) -> GatewayResult<Vec<Event>> {
        let snapshot = self.read_snapshot().await?;
        let events = snapshot
            .iter()
            .map(|(key, value)| Event::put(key.as_bytes(), value.clone()))
            .collect();
        *self.last.lock() = snapshot;
        Ok(events)
    }

    async fn watch(
        &self,
        pool: EventPool,
        sender: mpsc::Sender<PooledEvent>,
        shutdown: CancellationToken,
    ) -> GatewayResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |res: Result<FsEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| GatewayError::config(format!("Failed to create file watcher: {}", e)))?;

        // Watch the directory so editors that replace the file by rename are still observed
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("Failed to watch resource directory: {}", e)))?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| GatewayError::config("Invalid resource file path"))?
            .to_owned();

        info!(path = %self.path.display(), "Watching resource file");

        // catch up on edits made since fetch_all, before the watcher existed
        if !self.reload(&pool, &sender).await {
            return Ok(());
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let is_resource_file = event
                .paths
                .iter()
                .any(|path| path.file_name() == Some(file_name.as_os_str()));
            if !is_resource_file {
                continue;
            }

            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }

            tokio::time::sleep(SETTLE_DELAY).await;
            // collapse the burst of notifications a single save produces
            while rx.try_recv().is_ok() {}

            if !self.reload(&pool, &sender).await {
                debug!("Event receiver closed, stopping resource file watch");
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::event_pool;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fetch_all_synthesises_prefixed_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resources.yaml");
        tokio::fs::write(
            &path,
            r#"
routes:
  - id: 1
    uri: /get
consumers:
  - username: jack
    plugins:
      key-auth:
        key: secret
nonsense:
  - id: x
"#,
        )
        .await
        .unwrap();

        let feed = StandaloneFeed::new(&path, "/apisix/");
        let events = feed.fetch_all().await.unwrap();

        let keys: Vec<_> = events.iter().map(|e| e.key_str().into_owned()).collect();
        assert_eq!(keys, vec!["/apisix/consumers/jack", "/apisix/routes/1"]);

        let route: Value = serde_json::from_slice(&events[1].value).unwrap();
        assert_eq!(route["uri"], "/get");
    }

    #[test]
    fn test_diff_emits_puts_and_deletes() {
        let feed = StandaloneFeed::new("unused.yaml", "/apisix");
        let pool = event_pool(8);

        let old = feed
            .flatten(json!({"routes": [{"id": "1", "uri": "/a"}, {"id": "2", "uri": "/b"}]}))
            .unwrap();
        let new = feed
            .flatten(json!({"routes": [{"id": "1", "uri": "/changed"}, {"id": "3", "uri": "/c"}]}))
            .unwrap();

        let events = StandaloneFeed::diff(&old, &new, &pool);
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.event_type, e.key_str().into_owned()))
            .collect();

        assert_eq!(
            summary,
            vec![
                (EventType::Put, "/apisix/routes/1".to_string()),
                (EventType::Put, "/apisix/routes/3".to_string()),
                (EventType::Delete, "/apisix/routes/2".to_string()),
            ]
        );
    }

    #[test]
    fn test_non_mapping_document_is_rejected() {
        let feed = StandaloneFeed::new("unused.yaml", "/apisix");
        assert!(feed.flatten(json!([1, 2])).is_err());
        assert!(feed.flatten(Value::Null).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_emits_edits_made_before_it_started() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resources.yaml");
        tokio::fs::write(&path, "routes:\n  - id: 1\n    uri: /old\n").await.unwrap();

        let feed = Arc::new(StandaloneFeed::new(&path, "/apisix"));
        feed.fetch_all().await.unwrap();

        tokio::fs::write(&path, "routes:\n  - id: 1\n    uri: /new\n").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = {
            let feed = Arc::clone(&feed);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { feed.watch(event_pool(4), tx, shutdown).await })
        };

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::Put);
        assert_eq!(event.key_str(), "/apisix/routes/1");
        let route: Value = serde_json::from_slice(&event.value).unwrap();
        assert_eq!(route["uri"], "/new");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
