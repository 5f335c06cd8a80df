//! Memoizing tile cache with request coalescing.
//!
//! A lookup goes store first, then joins an in-flight computation for the same
//! key, and only then starts one. The computation runs on its own task so a
//! cancelled caller never strands the others; it stores the result, leaves the
//! in-flight table and broadcasts the outcome to every waiter, in that order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use formats::AssembledLayers;
use foundation::TileContext;
use layers::ExecutionError;
use tokio::sync::broadcast;

use crate::store::CacheStore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Derives a cache key from the tile being rendered.
pub type CacheKeyFn = Arc<dyn Fn(&TileContext) -> String + Send + Sync>;

/// Caching configuration at one level (request, layer or server).
///
/// Configuring a level, even with both fields unset, turns caching on.
#[derive(Clone, Default)]
pub struct CacheSettings {
    pub key: Option<CacheKeyFn>,
    pub ttl: Option<Duration>,
}

impl std::fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSettings")
            .field("key", &self.key.as_ref().map(|_| "<fn>"))
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CacheSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_key(mut self, key: impl Fn(&TileContext) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }
}

/// `tile:<source digest>/<layer>/<z>/<x>/<y>`.
///
/// The source identity is hashed so credentials in a connection string never
/// end up in the store's key space.
pub fn default_cache_key(source_identity: &str, tile: &TileContext) -> String {
    format!(
        "tile:{}/{}/{}/{}/{}",
        source_digest(source_identity),
        tile.layer,
        tile.z(),
        tile.x(),
        tile.y()
    )
}

/// Short stable digest of a data-source identity, safe to log or store.
pub(crate) fn source_digest(source_identity: &str) -> String {
    let digest = blake3::hash(source_identity.as_bytes()).to_hex();
    digest[..16].to_string()
}

/// Picks the effective key and TTL. Request beats layer beats server, field by
/// field; `None` when no level enabled caching.
pub fn resolve_cache_policy(
    levels: [Option<&CacheSettings>; 3],
    source_identity: &str,
    tile: &TileContext,
) -> Option<(String, Duration)> {
    if levels.iter().all(Option::is_none) {
        return None;
    }
    let key = levels
        .iter()
        .flatten()
        .find_map(|s| s.key.as_ref())
        .map(|f| f(tile))
        .unwrap_or_else(|| default_cache_key(source_identity, tile));
    let ttl = levels
        .iter()
        .flatten()
        .find_map(|s| s.ttl)
        .unwrap_or(DEFAULT_TTL);
    Some((key, ttl))
}

#[derive(Debug, Clone)]
pub enum CacheError {
    /// The shared computation failed; every waiter sees the same cause.
    Computation(Arc<ExecutionError>),
    /// The computation ended without reporting (task panicked or was aborted).
    Abandoned,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Computation(e) => write!(f, "cached computation failed: {e}"),
            CacheError::Abandoned => write!(f, "cached computation ended without a result"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Computation(e) => Some(e.as_ref() as _),
            CacheError::Abandoned => None,
        }
    }
}

type Outcome = Result<AssembledLayers, CacheError>;
type InFlight = DashMap<String, Flight>;

/// One registered computation. The id tells a leader's entry apart from a
/// later leader's entry under the same key.
struct Flight {
    id: u64,
    tx: broadcast::Sender<Outcome>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
}

pub struct TileCache {
    store: Arc<dyn CacheStore>,
    in_flight: Arc<InFlight>,
    next_flight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("in_flight", &self.in_flight.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl TileCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
            next_flight: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the cached layers for `key`, computing them at most once across
    /// concurrent callers.
    pub async fn get_or_compute<F>(&self, key: &str, ttl: Duration, compute: F) -> Outcome
    where
        F: Future<Output = Result<AssembledLayers, ExecutionError>> + Send + 'static,
    {
        if let Some(hit) = self.lookup(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key, "cache hit");
            return Ok(hit);
        }

        let mut rx = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "joining in-flight computation");
                entry.get().tx.subscribe()
            }
            Entry::Vacant(entry) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "cache miss");
                let (tx, rx) = broadcast::channel(1);
                let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                entry.insert(Flight { id, tx });
                self.spawn_leader(key.to_string(), id, ttl, compute);
                rx
            }
        };

        rx.recv().await.unwrap_or(Err(CacheError::Abandoned))
    }

    async fn lookup(&self, key: &str) -> Option<AssembledLayers> {
        let bytes = match self.store.get(key).await {
            Ok(found) => found?,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed; treating as miss");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(layers) => Some(layers),
            Err(e) => {
                tracing::warn!(key, error = %e, "cache entry undecodable; treating as miss");
                None
            }
        }
    }

    fn spawn_leader<F>(&self, key: String, id: u64, ttl: Duration, compute: F)
    where
        F: Future<Output = Result<AssembledLayers, ExecutionError>> + Send + 'static,
    {
        let store = self.store.clone();
        let guard = LeaderGuard {
            in_flight: self.in_flight.clone(),
            key,
            id,
            done: false,
        };
        tokio::spawn(async move {
            let outcome = compute.await.map_err(|e| CacheError::Computation(Arc::new(e)));
            if let Ok(layers) = &outcome {
                match serde_json::to_vec(layers) {
                    Ok(bytes) => {
                        if let Err(e) = store.set(&guard.key, bytes, ttl).await {
                            tracing::warn!(key = %guard.key, error = %e, "cache write failed");
                        }
                    }
                    Err(e) => tracing::warn!(key = %guard.key, error = %e, "cache entry not serializable"),
                }
            }
            guard.complete(outcome);
        });
    }
}

/// Owns the in-flight entry for one computation. Dropping it without
/// completing (panic, runtime shutdown) closes the channel so waiters see
/// [`CacheError::Abandoned`] instead of hanging.
///
/// Both paths remove the entry only while it still carries this guard's id;
/// once removed, the key may already belong to the next leader.
struct LeaderGuard {
    in_flight: Arc<InFlight>,
    key: String,
    id: u64,
    done: bool,
}

impl LeaderGuard {
    fn complete(mut self, outcome: Outcome) {
        self.done = true;
        if let Some(tx) = self.take_entry() {
            let waiters = tx.receiver_count();
            let _ = tx.send(outcome);
            tracing::debug!(key = %self.key, waiters, "computation broadcast");
        }
    }

    fn take_entry(&self) -> Option<broadcast::Sender<Outcome>> {
        self.in_flight
            .remove_if(&self.key, |_, flight| flight.id == self.id)
            .map(|(_, flight)| flight.tx)
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.done {
            self.take_entry();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use formats::{AssembledLayers, Feature, Geometry};
    use foundation::{TileContext, TileCoord};
    use layers::{BindArg, ExecutionError};
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    use super::{
        CacheError, CacheSettings, Flight, LeaderGuard, TileCache, default_cache_key,
        resolve_cache_policy,
    };
    use crate::store::MemoryStore;

    fn sample_layers(tag: i64) -> AssembledLayers {
        let mut props = Map::new();
        props.insert("tag".to_string(), tag.into());
        let mut layers = AssembledLayers::new();
        layers.insert("roads", vec![Feature::new(Geometry::Point([1.0, 2.0]), props)]);
        layers
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(TileCache::new(Arc::new(MemoryStore::new())));
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let runs = runs.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(sample_layers(7))
                    })
                    .await
            }));
        }

        // Wait until the single computation has started, then release it.
        while runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        while cache.stats().misses + cache.stats().coalesced < 16 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), sample_layers(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().coalesced, 15);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recomputes_after_ttl() {
        let cache = TileCache::new(Arc::new(MemoryStore::new()));
        let ttl = Duration::from_secs(30);

        let first = cache.get_or_compute("k", ttl, async { Ok(sample_layers(1)) }).await;
        let cached = cache.get_or_compute("k", ttl, async { Ok(sample_layers(2)) }).await;
        assert_eq!(first.unwrap(), sample_layers(1));
        assert_eq!(cached.unwrap(), sample_layers(1));
        assert_eq!(cache.stats().hits, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let fresh = cache.get_or_compute("k", ttl, async { Ok(sample_layers(2)) }).await;
        assert_eq!(fresh.unwrap(), sample_layers(2));
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn failures_are_shared_and_not_stored() {
        let cache = TileCache::new(Arc::new(MemoryStore::new()));
        let err = cache
            .get_or_compute("k", Duration::from_secs(5), async {
                Err(ExecutionError::Query {
                    statement: "SELECT broken".to_string(),
                    args: vec![BindArg::Null],
                    cause: "boom".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Computation(_)));

        let ok = cache
            .get_or_compute("k", Duration::from_secs(5), async { Ok(sample_layers(3)) })
            .await;
        assert_eq!(ok.unwrap(), sample_layers(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retried_failures_never_abandon_waiters() {
        let cache = Arc::new(TileCache::new(Arc::new(MemoryStore::new())));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let mut abandoned = 0;
                for _ in 0..2_000 {
                    let outcome = cache
                        .get_or_compute("k", Duration::from_secs(5), async {
                            Err(ExecutionError::PoolTimeout {
                                waited: Duration::from_millis(1),
                            })
                        })
                        .await;
                    match outcome {
                        Err(CacheError::Computation(_)) => {}
                        Err(CacheError::Abandoned) => abandoned += 1,
                        Ok(_) => panic!("failing computation produced layers"),
                    }
                }
                abandoned
            }));
        }

        let mut abandoned = 0;
        for h in handles {
            abandoned += h.await.unwrap();
        }
        assert_eq!(abandoned, 0);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn finished_leader_leaves_newer_flight_alone() {
        let cache = TileCache::new(Arc::new(MemoryStore::new()));
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        cache.in_flight.insert("k".to_string(), Flight { id: 2, tx });

        let stale = LeaderGuard {
            in_flight: cache.in_flight.clone(),
            key: "k".to_string(),
            id: 1,
            done: false,
        };
        stale.complete(Err(CacheError::Abandoned));
        let dropped = LeaderGuard {
            in_flight: cache.in_flight.clone(),
            key: "k".to_string(),
            id: 1,
            done: false,
        };
        drop(dropped);

        assert_eq!(cache.in_flight(), 1);
        assert!(rx.try_recv().is_err());

        let current = LeaderGuard {
            in_flight: cache.in_flight.clone(),
            key: "k".to_string(),
            id: 2,
            done: false,
        };
        current.complete(Ok(sample_layers(4)));
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(rx.try_recv().unwrap().unwrap(), sample_layers(4));
    }

    #[test]
    fn default_key_hides_source_identity() {
        let tile = TileContext::new("roads", TileCoord::new(4, 3, 2).unwrap());
        let key = default_cache_key("postgres://user:secret@db/gis", &tile);
        assert!(key.starts_with("tile:"));
        assert!(key.ends_with("/roads/4/3/2"));
        assert!(!key.contains("secret"));
        assert_ne!(key, default_cache_key("postgres://other", &tile));
    }

    #[test]
    fn policy_precedence() {
        let tile = TileContext::new("roads", TileCoord::new(1, 0, 0).unwrap());
        assert!(resolve_cache_policy([None, None, None], "src", &tile).is_none());

        let server = CacheSettings::new().with_ttl(Duration::from_secs(10));
        let layer = CacheSettings::new().with_key(|t| format!("layer:{}", t.layer));
        let request = CacheSettings::new().with_ttl(Duration::from_secs(2));

        let (key, ttl) =
            resolve_cache_policy([Some(&request), Some(&layer), Some(&server)], "src", &tile)
                .unwrap();
        assert_eq!(key, "layer:roads");
        assert_eq!(ttl, Duration::from_secs(2));

        let (key, ttl) = resolve_cache_policy([None, None, Some(&CacheSettings::new())], "src", &tile)
            .unwrap();
        assert_eq!(key, default_cache_key("src", &tile));
        assert_eq!(ttl, super::DEFAULT_TTL);
    }
}
