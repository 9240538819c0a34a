// src/cache.rs
//! Key/value cache port plus a bounded in-memory adapter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::CacheError;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
    last_used: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    tick: u64,
}

/// LRU with per-entry TTL. Expired entries are dropped lazily on access and
/// before any eviction.
pub struct MemoryCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut g = self.inner.lock();
        let now = Instant::now();
        g.tick += 1;
        let tick = g.tick;
        let expired = match g.entries.get_mut(key) {
            Some(e) if e.expires_at > now => {
                e.last_used = tick;
                return Ok(Some(e.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            g.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut g = self.inner.lock();
        let now = Instant::now();
        g.tick += 1;
        let tick = g.tick;

        if !g.entries.contains_key(key) && g.entries.len() >= self.capacity {
            g.entries.retain(|_, e| e.expires_at > now);
            if g.entries.len() >= self.capacity {
                let lru = g
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone());
                if let Some(k) = lru {
                    g.entries.remove(&k);
                }
            }
        }

        g.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
                last_used: tick,
            },
        );
        Ok(())
    }
}
