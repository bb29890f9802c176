//! # Config Store
//!
//! Durable, bucketed key-value mirror of the remote configuration. Every resource kind lives in
//! its own bucket, keyed by resource ID, holding the raw serialized resource bytes.
//!
//! ## Consistency model
//!
//! - The current contents are an immutable [`StoreState`] behind an `Arc`. Readers clone the `Arc`
//!   and keep a consistent snapshot for as long as they need it, regardless of concurrent writes.
//! - Writers are serialized by a mutex. A write copies the state, applies the change, persists the
//!   result and only then publishes it, so a failed event never partially applies. Buckets and the
//!   consumer index are shared copy-on-write, so a write only copies what it touches.
//! - The event consumer ([`ConfigStore::run`]) drains a burst of queued events into one batch,
//!   applies it in a single transaction with a single snapshot write, and does so on the blocking
//!   pool so disk I/O never stalls the async workers.
//! - The consumer credential index is part of the state and therefore always agrees with the
//!   `consumers` bucket.
//! - After a successful change to `routes`, `services` or `upstreams` every registered
//!   [`EventHook`] is called with the triggering event.

pub mod consumer_index;
pub mod event;
mod persistence;

use bytes::Bytes;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Consumer, Route, Service, Upstream};
use consumer_index::ConsumerIndex;
use persistence::{Bucket, SharedBuckets};

pub use event::{event_pool, Event, EventPool, EventType, PooledEvent};

pub const ROUTES: &str = "routes";
pub const SERVICES: &str = "services";
pub const UPSTREAMS: &str = "upstreams";
pub const CONSUMERS: &str = "consumers";
pub const PLUGIN_METADATA: &str = "plugin_metadata";

/// Every bucket the store knows about; the set is fixed when the store is opened
pub const BUCKETS: &[&str] = &[
    ROUTES,
    SERVICES,
    UPSTREAMS,
    CONSUMERS,
    "consumer_groups",
    "global_rules",
    "plugin_configs",
    PLUGIN_METADATA,
    "plugins",
    "protos",
    "ssls",
    "stream_routes",
];

/// Buckets whose changes invalidate the routing table
const ROUTING_BUCKETS: &[&str] = &[ROUTES, SERVICES, UPSTREAMS];

/// ID used in the synthetic events fired after a full snapshot replace
pub const SNAPSHOT_ID: &str = "*";

/// Most events [`ConfigStore::run`] folds into one transaction
pub const MAX_BATCH: usize = 256;

/// Callback notified after routing-relevant changes
///
/// Hooks run synchronously on the writing thread and must only signal, never rebuild.
pub trait EventHook: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, event: &Event);
}

#[derive(Debug, Clone)]
struct StoreState {
    buckets: SharedBuckets,
    consumers: Arc<ConsumerIndex>,
}

impl StoreState {
    fn empty() -> Self {
        Self {
            buckets: BUCKETS
                .iter()
                .map(|bucket| (bucket.to_string(), Arc::new(Bucket::new())))
                .collect(),
            consumers: Arc::new(ConsumerIndex::default()),
        }
    }

    fn bucket(&self, bucket: &str) -> GatewayResult<&Bucket> {
        self.buckets
            .get(bucket)
            .map(Arc::as_ref)
            .ok_or_else(|| GatewayError::not_found("bucket", bucket))
    }

    fn bucket_mut(&mut self, bucket: &str) -> GatewayResult<&mut Bucket> {
        self.buckets
            .get_mut(bucket)
            .map(Arc::make_mut)
            .ok_or_else(|| GatewayError::not_found("bucket", bucket))
    }

    /// Validates before mutating, so an error leaves the state untouched
    fn put(&mut self, bucket: &str, id: &str, value: Bytes) -> GatewayResult<()> {
        if !self.buckets.contains_key(bucket) {
            return Err(GatewayError::not_found("bucket", bucket));
        }
        let consumer = if bucket == CONSUMERS {
            let consumer: Consumer = serde_json::from_slice(&value)
                .map_err(|e| GatewayError::decode("consumer", id, e))?;
            Some(consumer)
        } else {
            None
        };

        self.bucket_mut(bucket)?.insert(id.to_string(), value);
        if let Some(consumer) = consumer {
            Arc::make_mut(&mut self.consumers).upsert(id, &consumer);
        }
        Ok(())
    }

    fn delete(&mut self, bucket: &str, id: &str) -> GatewayResult<()> {
        self.bucket_mut(bucket)?.remove(id);
        if bucket == CONSUMERS {
            Arc::make_mut(&mut self.consumers).remove(id);
        }
        Ok(())
    }

    fn apply(&mut self, bucket: &str, id: &str, event: &Event) -> GatewayResult<()> {
        match event.event_type {
            EventType::Put => self.put(bucket, id, Bytes::copy_from_slice(&event.value)),
            EventType::Delete => self.delete(bucket, id),
        }
    }

    fn rebuild_consumer_index(&mut self) {
        let mut index = ConsumerIndex::default();
        if let Some(consumers) = self.buckets.get(CONSUMERS) {
            for (id, value) in consumers.iter() {
                match serde_json::from_slice::<Consumer>(value) {
                    Ok(consumer) => index.upsert(id, &consumer),
                    Err(e) => warn!(consumer_id = %id, error = %e, "Skipping undecodable consumer"),
                }
            }
        }
        self.consumers = Arc::new(index);
    }
}

/// A consistent, read-only view of the store at one point in time
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    state: Arc<StoreState>,
}

impl StoreSnapshot {
    /// Raw bytes of one resource
    pub fn get(&self, bucket: &str, id: &str) -> GatewayResult<Bytes> {
        self.state
            .bucket(bucket)?
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(bucket, id))
    }

    /// Raw bytes of every resource in a bucket, ordered by ID
    pub fn list(&self, bucket: &str) -> GatewayResult<Vec<Bytes>> {
        Ok(self.state.bucket(bucket)?.values().cloned().collect())
    }

    /// Number of resources in a bucket
    pub fn len(&self, bucket: &str) -> usize {
        self.state.buckets.get(bucket).map_or(0, |entries| entries.len())
    }

    /// Decode one resource into its typed form
    pub fn decode<T: DeserializeOwned>(&self, bucket: &str, id: &str) -> GatewayResult<T> {
        let bytes = self.get(bucket, id)?;
        serde_json::from_slice(&bytes).map_err(|e| GatewayError::decode(bucket, id, e))
    }

    pub fn get_route(&self, id: &str) -> GatewayResult<Route> {
        let mut route: Route = self.decode(ROUTES, id)?;
        if route.id.is_empty() {
            route.id = id.to_string();
        }
        Ok(route)
    }

    pub fn get_service(&self, id: &str) -> GatewayResult<Service> {
        let mut service: Service = self.decode(SERVICES, id)?;
        if service.id.is_empty() {
            service.id = id.to_string();
        }
        Ok(service)
    }

    pub fn get_upstream(&self, id: &str) -> GatewayResult<Upstream> {
        let mut upstream: Upstream = self.decode(UPSTREAMS, id)?;
        if upstream.id.is_empty() {
            upstream.id = id.to_string();
        }
        Ok(upstream)
    }

    pub fn get_consumer(&self, id: &str) -> GatewayResult<Consumer> {
        self.decode(CONSUMERS, id)
    }

    /// Every decodable route; undecodable entries are logged and skipped
    pub fn list_routes(&self) -> Vec<Route> {
        let Ok(routes) = self.state.bucket(ROUTES) else {
            return Vec::new();
        };

        routes
            .keys()
            .filter_map(|id| match self.get_route(id) {
                Ok(route) => Some(route),
                Err(e) => {
                    warn!(route_id = %id, error = %e, "Skipping undecodable route");
                    None
                }
            })
            .collect()
    }

    /// Plugin-wide metadata object stored under the plugin's name
    pub fn plugin_metadata(&self, plugin: &str) -> Option<Value> {
        match self.decode::<Value>(PLUGIN_METADATA, plugin) {
            Ok(value) => Some(value),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "Ignoring undecodable plugin metadata");
                None
            }
        }
    }

    /// Consumer ID owning `credential` for `plugin`
    pub fn consumer_by_plugin_key(&self, plugin: &str, credential: &str) -> GatewayResult<String> {
        self.state
            .consumers
            .lookup(plugin, credential)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::not_found("consumer key", format!("{}:{}", plugin, credential)))
    }
}

/// Durable local mirror of the remote configuration
pub struct ConfigStore {
    state: RwLock<Arc<StoreState>>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
    hooks: RwLock<Vec<Arc<dyn EventHook>>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

impl ConfigStore {
    /// Open the store persisted at `path`, creating it when absent
    pub fn open<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref().to_path_buf();
        let persisted = persistence::load(&path)?;

        let mut state = StoreState::empty();
        for (bucket, entries) in persisted {
            match state.buckets.get_mut(&bucket) {
                Some(target) => *target = Arc::new(entries),
                None => warn!(bucket = %bucket, "Dropping unknown bucket from store file"),
            }
        }
        state.rebuild_consumer_index();

        info!(
            path = %path.display(),
            routes = state.buckets[ROUTES].len(),
            consumers = state.buckets[CONSUMERS].len(),
            "Config store opened"
        );

        Ok(Self::with_state(state, Some(path)))
    }

    /// A store that is never written to disk
    pub fn open_in_memory() -> Self {
        Self::with_state(StoreState::empty(), None)
    }

    fn with_state(state: StoreState, path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            path,
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Consistent view of the current contents
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            state: Arc::clone(&self.state.read()),
        }
    }

    /// Register a hook; a hook with the same name is replaced
    pub fn add_hook(&self, hook: Arc<dyn EventHook>) {
        let mut hooks = self.hooks.write();
        hooks.retain(|existing| existing.name() != hook.name());
        debug!(hook = %hook.name(), "Registered store event hook");
        hooks.push(hook);
    }

    pub fn remove_hook(&self, name: &str) {
        self.hooks.write().retain(|hook| hook.name() != name);
    }

    pub fn put(&self, bucket: &str, id: &str, value: impl Into<Bytes>) -> GatewayResult<()> {
        let value = value.into();
        let notify = ROUTING_BUCKETS.contains(&bucket).then(|| {
            Event::put(resource_key(bucket, id), value.to_vec())
        });

        self.commit(|state| state.put(bucket, id, value))?;

        if let Some(event) = notify {
            self.fire_hooks(&event);
        }
        Ok(())
    }

    pub fn delete(&self, bucket: &str, id: &str) -> GatewayResult<()> {
        self.commit(|state| state.delete(bucket, id))?;

        if ROUTING_BUCKETS.contains(&bucket) {
            self.fire_hooks(&Event::delete(resource_key(bucket, id)));
        }
        Ok(())
    }

    pub fn get(&self, bucket: &str, id: &str) -> GatewayResult<Bytes> {
        self.snapshot().get(bucket, id)
    }

    pub fn list(&self, bucket: &str) -> GatewayResult<Vec<Bytes>> {
        self.snapshot().list(bucket)
    }

    pub fn get_route(&self, id: &str) -> GatewayResult<Route> {
        self.snapshot().get_route(id)
    }

    pub fn get_service(&self, id: &str) -> GatewayResult<Service> {
        self.snapshot().get_service(id)
    }

    pub fn get_upstream(&self, id: &str) -> GatewayResult<Upstream> {
        self.snapshot().get_upstream(id)
    }

    pub fn get_consumer(&self, id: &str) -> GatewayResult<Consumer> {
        self.snapshot().get_consumer(id)
    }

    pub fn list_routes(&self) -> Vec<Route> {
        self.snapshot().list_routes()
    }

    pub fn plugin_metadata(&self, plugin: &str) -> Option<Value> {
        self.snapshot().plugin_metadata(plugin)
    }

    pub fn consumer_by_plugin_key(&self, plugin: &str, credential: &str) -> GatewayResult<String> {
        self.snapshot().consumer_by_plugin_key(plugin, credential)
    }

    /// Apply one watch event
    ///
    /// Events whose key does not resolve to a known bucket are logged and dropped. A value that
    /// cannot be indexed (a malformed consumer) fails the whole event and leaves the store as it was.
    pub fn apply(&self, event: &Event) -> GatewayResult<()> {
        let Some((bucket, id)) = resolve(event) else {
            return Ok(());
        };

        self.commit(|state| state.apply(bucket, id, event))?;
        applied(event, bucket, id);

        if ROUTING_BUCKETS.contains(&bucket) {
            self.fire_hooks(event);
        }
        Ok(())
    }

    /// Apply a burst of watch events in order as one transaction with one snapshot write
    ///
    /// Each event still applies all-or-nothing: one that fails is logged, counted and skipped
    /// without affecting the others. Returns how many events were applied.
    pub fn apply_batch<E>(&self, events: &[E]) -> GatewayResult<usize>
    where
        E: std::ops::Deref<Target = Event>,
    {
        let mut changes = Vec::with_capacity(events.len());

        self.commit(|state| {
            for event in events {
                let event: &Event = event;
                let Some((bucket, id)) = resolve(event) else {
                    continue;
                };
                match state.apply(bucket, id, event) {
                    Ok(()) => changes.push((event, bucket, id)),
                    Err(e) => {
                        warn!(key = %event.key_str(), error = %e, "Failed to apply config event");
                        counter!("config_store_event_errors_total").increment(1);
                    }
                }
            }
            Ok(())
        })?;

        for &(event, bucket, id) in &changes {
            applied(event, bucket, id);
            if ROUTING_BUCKETS.contains(&bucket) {
                self.fire_hooks(event);
            }
        }
        Ok(changes.len())
    }

    /// Reset the store to exactly the contents of a fetch-all snapshot
    ///
    /// Runs as one transaction. Individual entries that cannot be resolved or indexed are logged
    /// and skipped. Hooks fire once per routing bucket that had or now has contents.
    pub fn replace_all(&self, events: &[Event]) -> GatewayResult<()> {
        let previous = self.snapshot();
        let mut applied = 0usize;

        self.commit(|state| {
            *state = StoreState::empty();
            for event in events {
                let Some((bucket, id)) = event.split_key().filter(|(b, _)| BUCKETS.contains(b))
                else {
                    warn!(key = %event.key_str(), "Skipping snapshot entry with unknown bucket");
                    continue;
                };

                let result = match event.event_type {
                    EventType::Put => {
                        state.put(bucket, id, Bytes::copy_from_slice(&event.value))
                    }
                    EventType::Delete => state.delete(bucket, id),
                };

                match result {
                    Ok(()) => applied += 1,
                    Err(e) => warn!(key = %event.key_str(), error = %e, "Skipping snapshot entry"),
                }
            }
            Ok(())
        })?;

        let current = self.snapshot();
        info!(entries = applied, "Config store replaced from snapshot");

        for bucket in ROUTING_BUCKETS {
            if previous.len(bucket) > 0 || current.len(bucket) > 0 {
                self.fire_hooks(&Event::put(resource_key(bucket, SNAPSHOT_ID), Vec::new()));
            }
        }
        Ok(())
    }

    /// Consume the ordered event channel until it closes or shutdown is signalled
    ///
    /// Events already queued behind the one received are drained into the same batch, up to
    /// [`MAX_BATCH`]. Batches are applied one after another on the blocking pool, so order is kept.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PooledEvent>,
        shutdown: CancellationToken,
    ) {
        info!("Config store event consumer started");

        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match events.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }

            let size = batch.len();
            let store = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || store.apply_batch(&batch)).await {
                Ok(Ok(count)) => debug!(batch = size, applied = count, "Applied config event batch"),
                Ok(Err(e)) => {
                    error!(batch = size, error = %e, "Failed to commit config event batch");
                    counter!("config_store_event_errors_total").increment(size as u64);
                }
                Err(e) => {
                    error!(batch = size, error = %e, "Config event batch task failed");
                    counter!("config_store_event_errors_total").increment(size as u64);
                }
            }
        }

        info!("Config store event consumer stopped");
    }

    fn commit<F, T>(&self, mutate: F) -> GatewayResult<T>
    where
        F: FnOnce(&mut StoreState) -> GatewayResult<T>,
    {
        let _writer = self.writer.lock();

        // shallow: buckets are only copied once mutate touches them
        let mut next = StoreState::clone(&self.state.read());
        let result = mutate(&mut next)?;

        if let Some(path) = &self.path {
            persistence::save(path, &next.buckets)?;
        }

        *self.state.write() = Arc::new(next);
        Ok(result)
    }

    fn fire_hooks(&self, event: &Event) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.on_event(event);
        }
    }
}

/// Bucket and ID of an event, or `None` (logged and counted) when the key does not resolve
fn resolve(event: &Event) -> Option<(&str, &str)> {
    let Some((bucket, id)) = event.split_key() else {
        warn!(key = %event.key_str(), "Cannot resolve bucket from event key, dropping event");
        counter!("config_store_events_dropped_total").increment(1);
        return None;
    };

    if !BUCKETS.contains(&bucket) {
        warn!(key = %event.key_str(), bucket = %bucket, "Unknown bucket, dropping event");
        counter!("config_store_events_dropped_total").increment(1);
        return None;
    }
    Some((bucket, id))
}

fn applied(event: &Event, bucket: &str, id: &str) {
    debug!(
        event_type = %event.event_type,
        bucket = %bucket,
        id = %id,
        "Applied config event"
    );
    counter!("config_store_events_total", "bucket" => bucket.to_string()).increment(1);
}

fn resource_key(bucket: &str, id: &str) -> String {
    format!("/{}/{}", bucket, id)
}
