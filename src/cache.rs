use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

#[derive(Clone, Debug)]
struct CacheEntry {
    payload: Value,
    stored_at: Instant,
    ttl: Duration,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    // Bumped by every invalidation.
    epoch: u64,
}

/// Short-TTL response cache for polling-heavy endpoints.
///
/// Failures are never stored, and there is no per-key locking: two
/// concurrent misses for the same key both reach the upstream. A fetch that
/// overlaps an invalidation is returned to its caller but not stored.
#[derive(Debug)]
pub struct ResponseCache {
    entries: Mutex<Entries>,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, key: &str, ttl: Duration) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .map
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.payload.clone())
    }

    #[cfg(test)]
    pub fn insert(&self, key: &str, payload: Value, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Self::store(&mut entries.map, self.max_entries, key, payload, ttl);
    }

    fn epoch(&self) -> u64 {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epoch
    }

    fn insert_unless_invalidated(&self, key: &str, payload: Value, ttl: Duration, epoch: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.epoch != epoch {
            debug!("Cache invalidated while fetching {}, not storing", key);
            return;
        }
        Self::store(&mut entries.map, self.max_entries, key, payload, ttl);
    }

    fn store(
        entries: &mut HashMap<String, CacheEntry>,
        max_entries: usize,
        key: &str,
        payload: Value,
        ttl: Duration,
    ) {
        entries.retain(|_, entry| entry.stored_at.elapsed() < entry.ttl);

        if entries.len() >= max_entries && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!("Cache full, evicting {}", oldest);
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(payload) = self.get(key, ttl) {
            debug!("Cache hit for: {}", key);
            return Ok(payload);
        }

        let epoch = self.epoch();
        let payload = fetch().await?;
        self.insert_unless_invalidated(key, payload.clone(), ttl, epoch);
        Ok(payload)
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.epoch += 1;
        entries.map.retain(|key, _| !key.starts_with(prefix));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map
            .len()
    }
}

/// Cache key for day-scoped data: the local date is part of the key so the
/// entry rolls over at midnight.
pub fn daily_key(scope: &str, params: &[(&str, &str)]) -> String {
    let today = chrono::Local::now().date_naive();
    let mut key = format!("{scope}:{today}");
    for (name, value) in params {
        key.push_str(&format!(":{name}={value}"));
    }
    key
}
