//! Named TTL caches fronting hot read queries.
//!
//! Every entry owns its refresh function. `get` returns a value at most
//! `ttl` stale; a stale read runs the refresh under a per-entry latch so
//! concurrent readers coalesce onto a single refresh and all observe its
//! outcome. A failed refresh keeps the previous value and surfaces one
//! generic error; the cause is only logged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

type RefreshFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;
type RefreshAllFn =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, anyhow::Result<Vec<serde_json::Value>>> + Send + Sync>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("No cache entry for key `{0}`.")]
    UnknownKey(String),
    #[error("Failed to update cache.")]
    UpdateFailed,
}

struct EntryState {
    value: Option<serde_json::Value>,
    last_update: Option<Instant>,
}

struct CacheEntry {
    ttl: Duration,
    refresh: RefreshFn,
    /// Entries created through the `add_all` fallback take part in batched
    /// refreshes from `get_multiple`.
    bulk: bool,
    /// Single-flight latch: at most one refresh per key at a time.
    flight: AsyncMutex<()>,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    fn new(ttl: Duration, refresh: RefreshFn, bulk: bool) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            refresh,
            bulk,
            flight: AsyncMutex::new(()),
            state: Mutex::new(EntryState {
                value: None,
                last_update: None,
            }),
        })
    }

    fn fresh_value(&self, enabled: bool) -> Option<serde_json::Value> {
        if !enabled {
            return None;
        }
        let state = self.state.lock();
        match (&state.value, state.last_update) {
            (Some(value), Some(at)) if at.elapsed() <= self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    fn store(&self, value: serde_json::Value) {
        let mut state = self.state.lock();
        state.value = Some(value);
        state.last_update = Some(Instant::now());
    }

    fn expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        state
            .last_update
            .is_some_and(|at| now.duration_since(at) > self.ttl)
    }
}

/// A named key/value cache with per-entry TTL and refresh.
pub struct Cache {
    name: String,
    enabled: AtomicBool,
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
    refresh_all: Mutex<Option<(Duration, RefreshAllFn)>>,
    /// Latch for batched fallback refreshes.
    bulk_flight: AsyncMutex<()>,
}

/// The process-global namespace. Never swept; sweeping belongs to named
/// instances created with a sweep period.
static GLOBAL: Lazy<Arc<Cache>> = Lazy::new(|| Cache::new("global", None));

pub fn global() -> &'static Arc<Cache> {
    &GLOBAL
}

impl Cache {
    /// Create a named cache. With `sweep_period` set, a background task
    /// removes fully-expired entries on that period; its first run is
    /// jittered within the period so workers do not sweep in lockstep.
    pub fn new(name: impl Into<String>, sweep_period: Option<Duration>) -> Arc<Cache> {
        let cache = Arc::new(Cache {
            name: name.into(),
            enabled: AtomicBool::new(true),
            entries: Mutex::new(HashMap::new()),
            refresh_all: Mutex::new(None),
            bulk_flight: AsyncMutex::new(()),
        });
        if let Some(period) = sweep_period {
            let jitter_ms = rand::thread_rng().gen_range(0..period.as_millis().max(1) as u64);
            let jitter = Duration::from_millis(jitter_ms);
            tokio::spawn(Self::sweep_loop(Arc::downgrade(&cache), jitter, period));
        }
        cache
    }

    /// Turn caching off to force a refresh on every read. Values are still
    /// recorded, so re-enabling starts from warm state.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Relaxed);
    }

    /// Register a key with its TTL and refresh function.
    pub fn add(
        &self,
        key: impl Into<String>,
        ttl: Duration,
        refresh: impl Fn(String) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
            + Send
            + Sync
            + 'static,
    ) {
        let entry = CacheEntry::new(ttl, Arc::new(refresh), false);
        self.entries.lock().insert(key.into(), entry);
    }

    /// Register the fallback serving every key not individually added. The
    /// function receives the collective missing/stale key set and must
    /// return one value per key, in order.
    pub fn add_all(
        &self,
        ttl: Duration,
        refresh: impl Fn(Vec<String>) -> BoxFuture<'static, anyhow::Result<Vec<serde_json::Value>>>
            + Send
            + Sync
            + 'static,
    ) {
        *self.refresh_all.lock() = Some((ttl, Arc::new(refresh)));
    }

    pub async fn get(&self, key: &str) -> Result<serde_json::Value, CacheError> {
        let entry = self.entry_for(key)?;
        self.get_entry(key, &entry).await
    }

    /// Fetch several keys at once. Keys served by the `add_all` fallback are
    /// refreshed with a single batched invocation; results are returned in
    /// request order.
    pub async fn get_multiple(&self, keys: &[&str]) -> Result<Vec<serde_json::Value>, CacheError> {
        let enabled = self.enabled.load(Relaxed);
        let mut results: Vec<Option<serde_json::Value>> = vec![None; keys.len()];
        let mut batched: Vec<usize> = Vec::new();

        for (i, key) in keys.iter().enumerate() {
            let entry = self.entry_for(key)?;
            if entry.bulk {
                match entry.fresh_value(enabled) {
                    Some(value) => results[i] = Some(value),
                    None => batched.push(i),
                }
            } else {
                results[i] = Some(self.get_entry(key, &entry).await?);
            }
        }

        if !batched.is_empty() {
            let _latch = self.bulk_flight.lock().await;
            // A concurrent batch may have refreshed some of these already.
            batched.retain(|&i| {
                match self.entry_for(keys[i]).ok().and_then(|e| e.fresh_value(enabled)) {
                    Some(value) => {
                        results[i] = Some(value);
                        false
                    }
                    None => true,
                }
            });
            if !batched.is_empty() {
                let refresh = self
                    .refresh_all
                    .lock()
                    .as_ref()
                    .map(|(_, f)| f.clone())
                    .expect("bulk entries exist without an add_all registration");
                let stale_keys: Vec<String> = batched.iter().map(|&i| keys[i].to_owned()).collect();
                let values = match refresh(stale_keys).await {
                    Ok(values) if values.len() == batched.len() => values,
                    Ok(values) => {
                        tracing::warn!(
                            cache = %self.name,
                            expected = batched.len(),
                            got = values.len(),
                            "bulk cache refresh returned the wrong number of values"
                        );
                        return Err(CacheError::UpdateFailed);
                    }
                    Err(cause) => {
                        tracing::warn!(cache = %self.name, "bulk cache refresh failed: {cause:#}");
                        return Err(CacheError::UpdateFailed);
                    }
                };
                for (&i, value) in batched.iter().zip(values) {
                    let entry = self.entry_for(keys[i])?;
                    entry.store(value.clone());
                    results[i] = Some(value);
                }
            }
        }

        Ok(results.into_iter().map(|v| v.expect("every key resolved")).collect())
    }

    /// Clear a key's timestamp so the next read refreshes. Its counterpart
    /// [`Cache::invalidate_with`] replaces the value and marks it fresh.
    pub fn invalidate(&self, key: &str) {
        if let Some(entry) = self.entries.lock().get(key) {
            entry.state.lock().last_update = None;
        }
    }

    pub fn invalidate_with(&self, key: &str, value: serde_json::Value) {
        if let Some(entry) = self.entries.lock().get(key) {
            entry.store(value);
        }
    }

    pub fn invalidate_all(&self) {
        for entry in self.entries.lock().values() {
            entry.state.lock().last_update = None;
        }
    }

    fn entry_for(&self, key: &str) -> Result<Arc<CacheEntry>, CacheError> {
        if let Some(entry) = self.entries.lock().get(key) {
            return Ok(entry.clone());
        }
        let fallback = self.refresh_all.lock().clone();
        let Some((ttl, refresh_all)) = fallback else {
            return Err(CacheError::UnknownKey(key.to_owned()));
        };
        // Unregistered key served by the fallback: materialise an entry whose
        // own refresh routes through the batch function with a single key.
        let single: RefreshFn = Arc::new(move |key: String| {
            let refresh_all = refresh_all.clone();
            Box::pin(async move {
                let mut values = refresh_all(vec![key]).await?;
                values
                    .pop()
                    .ok_or_else(|| anyhow::anyhow!("bulk refresh returned no value"))
            })
        });
        let entry = CacheEntry::new(ttl, single, true);
        Ok(self
            .entries
            .lock()
            .entry(key.to_owned())
            .or_insert(entry)
            .clone())
    }

    async fn get_entry(
        &self,
        key: &str,
        entry: &Arc<CacheEntry>,
    ) -> Result<serde_json::Value, CacheError> {
        let enabled = self.enabled.load(Relaxed);
        if let Some(value) = entry.fresh_value(enabled) {
            return Ok(value);
        }
        let _latch = entry.flight.lock().await;
        // Whoever held the latch before us may have refreshed already.
        if let Some(value) = entry.fresh_value(enabled) {
            return Ok(value);
        }
        match (entry.refresh)(key.to_owned()).await {
            Ok(value) => {
                entry.store(value.clone());
                Ok(value)
            }
            Err(cause) => {
                tracing::warn!(cache = %self.name, key, "cache refresh failed: {cause:#}");
                Err(CacheError::UpdateFailed)
            }
        }
    }

    async fn sweep_loop(cache: Weak<Cache>, jitter: Duration, period: Duration) {
        tokio::time::sleep(jitter).await;
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(cache) = cache.upgrade() else { return };
            let now = Instant::now();
            cache.entries.lock().retain(|_, entry| !entry.expired(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_refresh(counter: Arc<AtomicUsize>, delay: Duration) -> RefreshFn {
        Arc::new(move |key: String| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Relaxed);
                tokio::time::sleep(delay).await;
                Ok(json!(format!("value-of-{key}")))
            })
        })
    }

    fn add_counting(cache: &Cache, key: &str, ttl: Duration, counter: Arc<AtomicUsize>, delay: Duration) {
        let refresh = counting_refresh(counter, delay);
        cache.add(key, ttl, move |key| refresh(key));
    }

    #[tokio::test]
    async fn get_of_unknown_key_fails() {
        let cache = Cache::new("t", None);
        assert_eq!(
            cache.get("nope").await.unwrap_err(),
            CacheError::UnknownKey("nope".to_owned())
        );
    }

    #[tokio::test]
    async fn fresh_value_is_served_without_refresh() {
        let cache = Cache::new("t", None);
        let calls = Arc::new(AtomicUsize::new(0));
        add_counting(&cache, "k", Duration::from_secs(60), calls.clone(), Duration::ZERO);

        assert_eq!(cache.get("k").await.unwrap(), json!("value-of-k"));
        assert_eq!(cache.get("k").await.unwrap(), json!("value-of-k"));
        assert_eq!(calls.load(Relaxed), 1);
    }

    #[tokio::test]
    async fn stale_value_triggers_refresh() {
        let cache = Cache::new("t", None);
        let calls = Arc::new(AtomicUsize::new(0));
        add_counting(&cache, "k", Duration::from_millis(10), calls.clone(), Duration::ZERO);

        cache.get("k").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get("k").await.unwrap();
        assert_eq!(calls.load(Relaxed), 2);
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_refresh() {
        let cache = Cache::new("t", None);
        let calls = Arc::new(AtomicUsize::new(0));
        add_counting(&cache, "k", Duration::from_secs(60), calls.clone(), Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("k").await.unwrap() }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!("value-of-k"));
        }
        assert_eq!(calls.load(Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_prior_value() {
        let cache = Cache::new("t", None);
        let fail = Arc::new(AtomicBool::new(false));
        let fail_toggle = fail.clone();
        cache.add("k", Duration::from_millis(10), move |_| {
            let fail = fail_toggle.clone();
            Box::pin(async move {
                if fail.load(Relaxed) {
                    anyhow::bail!("database on fire")
                }
                Ok(json!(1))
            })
        });

        assert_eq!(cache.get("k").await.unwrap(), json!(1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        fail.store(true, Relaxed);
        assert_eq!(cache.get("k").await.unwrap_err(), CacheError::UpdateFailed);
        // The prior value is retained and served once the refresh recovers.
        fail.store(false, Relaxed);
        assert_eq!(cache.get("k").await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn invalidate_forces_refresh_and_invalidate_with_replaces() {
        let cache = Cache::new("t", None);
        let calls = Arc::new(AtomicUsize::new(0));
        add_counting(&cache, "k", Duration::from_secs(60), calls.clone(), Duration::ZERO);

        cache.get("k").await.unwrap();
        cache.invalidate("k");
        cache.get("k").await.unwrap();
        assert_eq!(calls.load(Relaxed), 2);

        cache.invalidate_with("k", json!("pinned"));
        assert_eq!(cache.get("k").await.unwrap(), json!("pinned"));
        assert_eq!(calls.load(Relaxed), 2);
    }

    #[tokio::test]
    async fn disabled_cache_refreshes_every_read() {
        let cache = Cache::new("t", None);
        let calls = Arc::new(AtomicUsize::new(0));
        add_counting(&cache, "k", Duration::from_secs(60), calls.clone(), Duration::ZERO);
        cache.set_enabled(false);

        cache.get("k").await.unwrap();
        cache.get("k").await.unwrap();
        assert_eq!(calls.load(Relaxed), 2);
    }

    #[tokio::test]
    async fn get_multiple_batches_fallback_keys_in_order() {
        let cache = Cache::new("t", None);
        let calls = Arc::new(AtomicUsize::new(0));
        let batch_calls = calls.clone();
        cache.add_all(Duration::from_secs(60), move |keys| {
            batch_calls.fetch_add(1, Relaxed);
            Box::pin(async move {
                Ok(keys.into_iter().map(|k| json!(format!("bulk-{k}"))).collect())
            })
        });

        let values = cache.get_multiple(&["b", "a", "c"]).await.unwrap();
        assert_eq!(values, vec![json!("bulk-b"), json!("bulk-a"), json!("bulk-c")]);
        assert_eq!(calls.load(Relaxed), 1);

        // All three are fresh now; no further batch call.
        cache.get_multiple(&["a", "c"]).await.unwrap();
        assert_eq!(calls.load(Relaxed), 1);
    }

    #[tokio::test]
    async fn single_get_uses_fallback_for_unregistered_key() {
        let cache = Cache::new("t", None);
        cache.add_all(Duration::from_secs(60), |keys| {
            Box::pin(async move { Ok(keys.into_iter().map(|k| json!(k)).collect()) })
        });
        assert_eq!(cache.get("solo").await.unwrap(), json!("solo"));
    }

    #[tokio::test]
    async fn sweeper_removes_fully_expired_entries() {
        let cache = Cache::new("t", Some(Duration::from_millis(50)));
        cache.add_all(Duration::from_millis(10), |keys| {
            Box::pin(async move { Ok(keys.into_iter().map(|k| json!(k)).collect()) })
        });
        cache.get("gone").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(cache.entries.lock().get("gone").is_none());
    }
}
