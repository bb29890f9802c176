//! # Object Pool
//!
//! Free-list pool for objects that are checked out on the hot path (store events, per-request
//! variable namespaces). The pool wrapper itself wipes every object on the way back in, so a
//! freshly acquired object never carries state from its previous holder.
//!
//! ## Rust Concepts Used
//!
//! - RAII: [`Pooled<T>`] returns its object to the pool in `Drop`, so release cannot be forgotten
//!   and a double release is impossible (the guard is consumed by [`Pooled::release`])
//! - `Arc<PoolInner<T>>` keeps the free list alive for as long as any checkout exists
//! - `parking_lot::Mutex` guards the free list; checkouts themselves are single-owner

use metrics::counter;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Objects that can be reset to their pristine state before being reused
pub trait Recycle {
    /// Clear every piece of state the previous holder may have left behind
    fn recycle(&mut self);
}

struct PoolInner<T> {
    free: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    max_idle: usize,
    stats: PoolStats,
}

/// Pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl PoolStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Shared handle to a pool of reusable objects
pub struct ObjectPool<T: Recycle> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Recycle> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Recycle> ObjectPool<T> {
    /// Number of released objects waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }
}

impl<T: Recycle> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("idle", &self.idle())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

impl<T: Recycle + Send + 'static> ObjectPool<T> {
    /// Create a pool that keeps at most `max_idle` released objects around
    pub fn new<F>(factory: F, max_idle: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_idle)),
                factory: Box::new(factory),
                max_idle,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Check an object out of the pool, creating a new one when the free list is empty
    pub fn acquire(&self) -> Pooled<T> {
        let reused = self.inner.free.lock().pop();

        let object = match reused {
            Some(object) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                counter!("object_pool_hits").increment(1);
                object
            }
            None => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                counter!("object_pool_misses").increment(1);
                (self.inner.factory)()
            }
        };

        Pooled {
            object: Some(object),
            pool: Arc::clone(&self.inner),
        }
    }

}

/// A checked-out object; it is wiped and handed back to its pool when dropped
pub struct Pooled<T: Recycle> {
    object: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Recycle> Pooled<T> {
    /// Return the object to the pool now instead of at end of scope
    pub fn release(self) {
        drop(self);
    }
}

impl<T: Recycle> std::ops::Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.object
            .as_ref()
            .expect("pooled object is only taken in drop")
    }
}

impl<T: Recycle> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object
            .as_mut()
            .expect("pooled object is only taken in drop")
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.object).finish()
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut object) = self.object.take() {
            object.recycle();

            let mut free = self.pool.free.lock();
            if free.len() < self.pool.max_idle {
                free.push(object);
            } else {
                debug!("object pool full, dropping released object");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Scratch {
        entries: Vec<String>,
    }

    impl Recycle for Scratch {
        fn recycle(&mut self) {
            self.entries.clear();
        }
    }

    #[test]
    fn test_released_object_is_wiped_before_reuse() {
        let pool = ObjectPool::new(Scratch::default, 4);

        let mut first = pool.acquire();
        first.entries.push("secret".to_string());
        first.release();

        let second = pool.acquire();
        assert!(second.entries.is_empty());
        assert_eq!(pool.stats().hits(), 1);
        assert_eq!(pool.stats().misses(), 1);
    }

    #[test]
    fn test_pool_caps_idle_objects() {
        let pool = ObjectPool::new(Scratch::default, 1);

        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);

        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_checkout_can_move_across_threads() {
        let pool = ObjectPool::new(Scratch::default, 2);
        let mut object = pool.acquire();
        object.entries.push("x".to_string());

        std::thread::spawn(move || drop(object)).join().unwrap();

        assert_eq!(pool.idle(), 1);
        assert!(pool.acquire().entries.is_empty());
    }

    #[test]
    fn test_debug_reports_idle_objects() {
        let pool = ObjectPool::new(Scratch::default, 3);
        pool.acquire().release();

        let rendered = format!("{:?}", pool);
        assert!(rendered.contains("idle: 1"));
        assert!(rendered.contains("max_idle: 3"));
    }
}
