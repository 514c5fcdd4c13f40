//! ETag response cache.
//!
//! Each request fingerprint maps to a validator and the serialized decoded
//! body. Both live and expire together; a hit refreshes both.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::{Result, SpfyError};

/// Order-independent fingerprint of a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `params` must already be canonical (sanitized and sorted).
    pub fn compute(url: &str, params: &[(String, String)], body: Option<&[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
        for (name, value) in params {
            hasher.update(name.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([b'&']);
        }
        hasher.update([0u8]);
        if let Some(body) = body {
            hasher.update(body);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn etag_key(&self) -> String {
        format!("{}:etag", self.0)
    }

    pub fn response_key(&self) -> String {
        format!("{}:response", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validator with its serialized body. The validator is never empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    etag: String,
    body: Vec<u8>,
}

impl CacheEntry {
    /// Returns `None` when `etag` is blank.
    pub fn new(etag: impl Into<String>, body: Vec<u8>) -> Option<Self> {
        let etag = etag.into();
        if etag.trim().is_empty() {
            return None;
        }
        Some(Self { etag, body })
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// TTL-capable key/value backing for [`EtagCache`].
///
/// Validator and body are separate sub-entries so a backend may lose one
/// without the other; callers treat that as corruption.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn etag(&self, key: &CacheKey) -> Result<Option<String>>;

    async fn body(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &CacheKey, entry: CacheEntry, ttl: Duration) -> Result<()>;

    /// Resets the TTL of both sub-entries.
    async fn touch(&self, key: &CacheKey, ttl: Duration) -> Result<()>;

    async fn invalidate(&self, key: &CacheKey) -> Result<()>;

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let Some(etag) = self.etag(key).await? else {
            return Ok(None);
        };
        let Some(body) = self.body(key).await? else {
            return Ok(None);
        };
        Ok(CacheEntry::new(etag, body))
    }
}

/// Minimum spacing between full sweeps of expired entries on write.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process store.
///
/// Expired entries are dropped when read, and swept from the whole map on
/// write at most once per [`SWEEP_INTERVAL`]. With a capacity set, writing a
/// new key into a full store evicts the entry closest to expiry.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    max_entries: Option<usize>,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<CacheKey, (CacheEntry, Instant)>,
    next_sweep: Option<Instant>,
}

impl MemoryState {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        self.next_sweep = Some(now + SWEEP_INTERVAL);
        before - self.entries.len()
    }

    fn evict_soonest(&mut self) {
        let soonest = self
            .entries
            .iter()
            .min_by_key(|(_, (_, expires_at))| *expires_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = soonest {
            self.entries.remove(&key);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding at most `max_entries` keys (at least one).
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            state: Mutex::default(),
            max_entries: Some(max_entries.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry now; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.state.lock().sweep(Instant::now())
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn live(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some((entry, expires_at)) if *expires_at > Instant::now() => Some(entry.clone()),
            Some(_) => {
                state.entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").field("len", &self.len()).finish()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn etag(&self, key: &CacheKey) -> Result<Option<String>> {
        Ok(self.live(key).map(|entry| entry.etag))
    }

    async fn body(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self.live(key).map(|entry| entry.body))
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.next_sweep.map_or(true, |at| now >= at) {
            state.sweep(now);
        }
        if let Some(max_entries) = self.max_entries {
            if state.entries.len() >= max_entries && !state.entries.contains_key(key) {
                state.sweep(now);
                if state.entries.len() >= max_entries {
                    state.evict_soonest();
                }
            }
        }
        state.entries.insert(key.clone(), (entry, now + ttl));
        Ok(())
    }

    async fn touch(&self, key: &CacheKey, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        if let Some((_, expires_at)) = self.state.lock().entries.get_mut(key) {
            if *expires_at > now {
                *expires_at = now + ttl;
            }
        }
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.state.lock().entries.remove(key);
        Ok(())
    }
}

/// The client's view of the cache: best-effort, never fails a call.
#[derive(Clone)]
pub struct EtagCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl fmt::Debug for EtagCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtagCache").field("ttl", &self.ttl).finish()
    }
}

impl EtagCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryStore::new()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Validator to send as `If-None-Match`, if one is cached.
    pub async fn validator(&self, key: &CacheKey) -> Option<String> {
        match self.store.etag(key).await {
            Ok(etag) => etag,
            Err(err) => {
                tracing::warn!(%key, error = %err, "etag lookup failed");
                None
            }
        }
    }

    /// Cached body for a 304 reply, with its TTL refreshed.
    ///
    /// A missing or unreadable body invalidates the key and returns `None`.
    pub async fn revive(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let decoded = match self.store.body(key).await {
            Ok(Some(bytes)) => decode_body(&bytes),
            Ok(None) => Err(SpfyError::Cache("cached body is missing".to_owned())),
            Err(err) => Err(err),
        };

        match decoded {
            Ok(value) => {
                tracing::info!(%key, "cache hit");
                if let Err(err) = self.store.touch(key, self.ttl).await {
                    tracing::warn!(%key, error = %err, "cannot refresh cache entry");
                }
                Some(value)
            }
            Err(err) => {
                tracing::error!(%key, error = %err, "cached response is invalid");
                self.invalidate(key).await;
                None
            }
        }
    }

    /// Stores `value` under `key`; without a validator nothing is written.
    pub async fn remember(&self, key: &CacheKey, etag: Option<&str>, value: &serde_json::Value) {
        let Some(etag) = etag else {
            return;
        };
        let body = match encode_body(value) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(%key, error = %err, "cannot serialize response for cache");
                return;
            }
        };
        let Some(entry) = CacheEntry::new(etag, body) else {
            return;
        };
        tracing::debug!(%key, etag, "caching response");
        if let Err(err) = self.store.put(key, entry, self.ttl).await {
            tracing::warn!(%key, error = %err, "cannot write cache entry");
        }
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        if let Err(err) = self.store.invalidate(key).await {
            tracing::warn!(%key, error = %err, "cannot invalidate cache entry");
        }
    }
}

pub(crate) fn encode_body(value: &serde_json::Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| SpfyError::Cache(err.to_string()))
}

pub(crate) fn decode_body(bytes: &[u8]) -> Result<serde_json::Value> {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(serde_json::Value::Null) => Err(SpfyError::Cache("cached body is null".to_owned())),
        Ok(value) => Ok(value),
        Err(err) => Err(SpfyError::Cache(format!("cached body is unreadable: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{CacheEntry, CacheKey, CacheStore, EtagCache, MemoryStore};

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn key_is_deterministic_and_sensitive() {
        let params = pairs(&[("limit", "50"), ("offset", "0")]);
        let a = CacheKey::compute("https://api/v1/me/tracks", &params, None);
        let b = CacheKey::compute("https://api/v1/me/tracks", &params, None);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let other_url = CacheKey::compute("https://api/v1/me/albums", &params, None);
        let with_body = CacheKey::compute("https://api/v1/me/tracks", &params, Some(b"{}"));
        let other_params =
            CacheKey::compute("https://api/v1/me/tracks", &pairs(&[("limit", "20")]), None);
        assert_ne!(a, other_url);
        assert_ne!(a, with_body);
        assert_ne!(a, other_params);
    }

    #[test]
    fn key_does_not_confuse_param_boundaries() {
        let a = CacheKey::compute("u", &pairs(&[("ab", "c")]), None);
        let b = CacheKey::compute("u", &pairs(&[("a", "bc")]), None);
        assert_ne!(a, b);
    }

    #[test]
    fn entry_requires_etag() {
        assert!(CacheEntry::new("", b"{}".to_vec()).is_none());
        assert!(CacheEntry::new("  ", b"{}".to_vec()).is_none());
        assert_eq!(
            CacheEntry::new("\"abc\"", b"{}".to_vec()).map(|e| e.etag().to_owned()),
            Some("\"abc\"".to_owned())
        );
    }

    #[tokio::test]
    async fn round_trip_preserves_structure_and_precision() {
        let cache = EtagCache::in_memory(Duration::from_secs(60));
        let key = CacheKey::compute("https://api/v1/audio-features", &[], None);
        let value = json!({
            "audio_features": [{"tempo": 118.211_000_000_000_01, "key": 5, "duration_ms": 18446744073709551615u64}],
            "href": null,
            "name": "Dvořák \u{1F3B5}"
        });

        cache.remember(&key, Some("\"v1\""), &value).await;

        assert_eq!(cache.validator(&key).await.as_deref(), Some("\"v1\""));
        assert_eq!(cache.revive(&key).await, Some(value));
    }

    #[tokio::test]
    async fn nothing_is_stored_without_validator() {
        let store = Arc::new(MemoryStore::new());
        let cache = EtagCache::new(store.clone(), Duration::from_secs(60));
        let key = CacheKey::compute("https://api/v1/me", &[], None);

        cache.remember(&key, None, &json!({"id": "me"})).await;
        cache.remember(&key, Some(""), &json!({"id": "me"})).await;

        assert!(store.is_empty());
        assert_eq!(cache.validator(&key).await, None);
    }

    #[tokio::test]
    async fn corrupt_body_is_a_miss_and_invalidates() {
        let store = Arc::new(MemoryStore::new());
        let cache = EtagCache::new(store.clone(), Duration::from_secs(60));
        let key = CacheKey::compute("https://api/v1/me", &[], None);
        let entry = CacheEntry::new("\"v1\"", b"\x93\xa4junk".to_vec()).expect("etag");
        store
            .put(&key, entry, Duration::from_secs(60))
            .await
            .expect("memory put");

        assert_eq!(cache.revive(&key).await, None);
        assert_eq!(cache.validator(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hits_slide_expiry_forward() {
        let cache = EtagCache::in_memory(Duration::from_secs(10));
        let key = CacheKey::compute("https://api/v1/me", &[], None);
        cache.remember(&key, Some("\"v1\""), &json!({"id": "me"})).await;

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.revive(&key).await.is_some());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.validator(&key).await.as_deref(), Some("\"v1\""));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.validator(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_expired_entries() {
        let store = MemoryStore::new();
        for n in 0..10_000 {
            let key = CacheKey::compute(&format!("https://api/v1/tracks/{n}"), &[], None);
            let entry = CacheEntry::new("\"v\"", b"{}".to_vec()).expect("etag");
            store.put(&key, entry, Duration::from_secs(1)).await.expect("memory put");
        }
        assert_eq!(store.stored(), 10_000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        for n in 0..10 {
            let key = CacheKey::compute(&format!("https://api/v1/albums/{n}"), &[], None);
            let entry = CacheEntry::new("\"v\"", b"{}".to_vec()).expect("etag");
            store.put(&key, entry, Duration::from_secs(60)).await.expect("memory put");
        }

        assert_eq!(store.len(), 10);
        assert_eq!(store.stored(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_expired_reports_removed_entries() {
        let store = MemoryStore::new();
        for (n, ttl) in [(0, 5), (1, 5), (2, 120)] {
            let key = CacheKey::compute(&format!("https://api/v1/me/{n}"), &[], None);
            let entry = CacheEntry::new("\"v\"", b"{}".to_vec()).expect("etag");
            store.put(&key, entry, Duration::from_secs(ttl)).await.expect("memory put");
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.cleanup_expired(), 2);
        assert_eq!(store.stored(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_entry_closest_to_expiry() {
        let store = MemoryStore::with_capacity(2);
        let keys: Vec<_> = (0..3)
            .map(|n| CacheKey::compute(&format!("https://api/v1/artists/{n}"), &[], None))
            .collect();
        for (key, ttl) in keys.iter().zip([30, 10, 60]) {
            let entry = CacheEntry::new("\"v\"", b"{}".to_vec()).expect("etag");
            store.put(key, entry, Duration::from_secs(ttl)).await.expect("memory put");
        }

        assert_eq!(store.stored(), 2);
        assert!(store.etag(&keys[0]).await.expect("memory").is_some());
        assert!(store.etag(&keys[1]).await.expect("memory").is_none());
        assert!(store.etag(&keys[2]).await.expect("memory").is_some());
    }

    #[tokio::test]
    async fn get_combines_sub_entries() {
        let store = MemoryStore::new();
        let key = CacheKey::compute("https://api/v1/me", &[], None);
        assert_eq!(store.get(&key).await.expect("memory"), None);

        let entry = CacheEntry::new("\"v2\"", b"{\"a\":1}".to_vec()).expect("etag");
        store
            .put(&key, entry.clone(), Duration::from_secs(5))
            .await
            .expect("memory put");
        assert_eq!(store.get(&key).await.expect("memory"), Some(entry));

        store.invalidate(&key).await.expect("memory invalidate");
        assert_eq!(store.get(&key).await.expect("memory"), None);
    }
}
