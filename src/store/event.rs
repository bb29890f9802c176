//! Change events flowing from the config feed into the store.

use crate::core::pool::{ObjectPool, Pooled, Recycle};
use std::fmt;

/// Kind of change carried by an [`Event`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EventType {
    #[default]
    Put,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Put => write!(f, "put"),
            EventType::Delete => write!(f, "delete"),
        }
    }
}

/// One change from the remote watch stream: a hierarchical key and the raw value bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Event {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: EventType::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: EventType::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    /// Overwrite this event in place, reusing its buffers
    pub fn fill(&mut self, event_type: EventType, key: &[u8], value: &[u8]) {
        self.event_type = event_type;
        self.key.clear();
        self.key.extend_from_slice(key);
        self.value.clear();
        self.value.extend_from_slice(value);
    }

    /// Copy another event into this one, reusing its buffers
    pub fn copy_from(&mut self, other: &Event) {
        self.fill(other.event_type, &other.key, &other.value);
    }

    /// Bucket and resource ID derived from the last two `/` segments of the key
    ///
    /// `/apisix/routes/1` yields `("routes", "1")`. Keys that are not UTF-8 or have fewer than two
    /// non-empty trailing segments yield `None`.
    pub fn split_key(&self) -> Option<(&str, &str)> {
        let key = std::str::from_utf8(&self.key).ok()?;
        let mut segments = key.trim_end_matches('/').rsplit('/');
        let id = segments.next().filter(|s| !s.is_empty())?;
        let bucket = segments.next().filter(|s| !s.is_empty())?;
        Some((bucket, id))
    }

    /// Lossy key string for logging
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

impl Recycle for Event {
    fn recycle(&mut self) {
        self.event_type = EventType::default();
        self.key.clear();
        self.value.clear();
    }
}

/// Pool of reusable events shared by the feed and the store consumer
pub type EventPool = ObjectPool<Event>;

/// A checked-out event; wiped and returned to its pool on drop
pub type PooledEvent = Pooled<Event>;

pub fn event_pool(max_idle: usize) -> EventPool {
    ObjectPool::new(Event::default, max_idle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key_takes_last_two_segments() {
        let event = Event::put("/apisix/routes/1", "{}");
        assert_eq!(event.split_key(), Some(("routes", "1")));

        let event = Event::delete("/a/b/c/consumers/jack/");
        assert_eq!(event.split_key(), Some(("consumers", "jack")));
    }

    #[test]
    fn test_split_key_rejects_short_keys() {
        assert_eq!(Event::put("routes", "").split_key(), None);
        assert_eq!(Event::put("/1", "").split_key(), None);
        assert_eq!(Event::put(vec![0xff, b'/', 0xfe], "").split_key(), None);
    }

    #[test]
    fn test_pooled_event_has_no_residual_state() {
        let pool = event_pool(8);

        let mut event = pool.acquire();
        event.fill(EventType::Delete, b"/apisix/upstreams/u1", b"secret");
        event.release();

        let event = pool.acquire();
        assert_eq!(event.event_type, EventType::Put);
        assert!(event.key.is_empty());
        assert!(event.value.is_empty());
    }
}
