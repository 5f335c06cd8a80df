//! Byte stores backing the tile cache.

use std::collections::HashMap;
use std::time::Duration;

use layers::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct StoreError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cache store: {}", self.message)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Key/value store with per-entry expiry. Values are opaque bytes.
pub trait CacheStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// How often `set` sweeps expired entries out of a [`MemoryStore`].
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process-local store. Expiry follows the tokio clock, so paused-time tests
/// can step past a TTL.
///
/// Expired entries go on read, and every [`SWEEP_INTERVAL`] a write sweeps
/// the rest, so keys that are never read again do not pile up.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, (Vec<u8>, Instant)>,
    next_sweep: Option<Instant>,
}

impl Entries {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, (_, expires)| *expires > now);
        self.next_sweep = Some(now + SWEEP_INTERVAL);
        before - self.map.len()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().purge(Instant::now())
    }

    fn get_now(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let expired = inner.map.get(key).map(|(_, expires)| *expires <= Instant::now())?;
        if expired {
            inner.map.remove(key);
            return None;
        }
        inner.map.get(key).map(|(bytes, _)| bytes.clone())
    }

    fn set_now(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.next_sweep.is_none_or(|due| now >= due) {
            let removed = inner.purge(now);
            if removed > 0 {
                tracing::debug!(removed, remaining = inner.map.len(), "swept expired cache entries");
            }
        }
        inner.map.insert(key.to_string(), (value, now + ttl));
    }
}

impl CacheStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move { Ok(self.get_now(key)) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.set_now(key, value, ttl);
            Ok(())
        })
    }
}
