//! The central caching engine (§4.4): turns a narrow [`PersistentStoreCore`]
//! into a full [`DataStore`], coalescing concurrent reads, bounding
//! cache-coherence cost on writes, and degrading gracefully across backend
//! outages per the configured [`CacheTtl`].

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use flagcore_concurrent::{AtomicFlag, SingleFlight};

use super::persistent_core::PersistentStoreCore;
use super::status::{StoreStatus, StoreStatusManager, DEFAULT_POLL_INTERVAL};
use super::DataStore;
use crate::dependency_order::order_collections;
use crate::error::StoreError;
use crate::model::{data_kind_for, from_serialized, to_serialized, Collection, ItemDescriptor, Kind};

/// The wrapper's caching mode (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheTtl {
    /// Every read goes straight to the backend.
    Disabled,
    /// Cached entries expire after the given duration.
    Finite(Duration),
    /// Entries never expire until explicit invalidation.
    Infinite,
}

/// Construction knobs for [`PersistentStoreWrapper`]. `spec.md` leaves
/// configuration loading itself out of scope, but the shape of these knobs
/// is part of this crate's public surface.
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub cache_ttl: CacheTtl,
    pub status_poll_interval: Duration,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            cache_ttl: CacheTtl::Disabled,
            status_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

struct ItemEntry {
    item: ItemDescriptor,
    inserted_at: Instant,
}

struct AllEntry {
    items: HashMap<String, ItemDescriptor>,
    inserted_at: Instant,
}

#[derive(Default)]
struct Caches {
    items: HashMap<(Kind, String), ItemEntry>,
    all: HashMap<Kind, AllEntry>,
    init_checked_false_at: Option<Instant>,
}

fn is_fresh(inserted_at: Instant, ttl: CacheTtl) -> bool {
    match ttl {
        CacheTtl::Disabled => false,
        CacheTtl::Infinite => true,
        CacheTtl::Finite(d) => inserted_at.elapsed() < d,
    }
}

fn filter_tombstones(items: Vec<(String, ItemDescriptor)>) -> Vec<(String, ItemDescriptor)> {
    items.into_iter().filter(|(_, v)| !v.is_tombstone()).collect()
}

async fn backend_get(
    backend: Arc<dyn PersistentStoreCore>,
    kind: Kind,
    key: String,
) -> Result<ItemDescriptor, StoreError> {
    let serialized = backend.get(kind, &key).await?;
    let data_kind = data_kind_for(kind);
    from_serialized(data_kind.as_ref(), &serialized).map_err(StoreError::from)
}

async fn backend_get_all(
    backend: Arc<dyn PersistentStoreCore>,
    kind: Kind,
) -> Result<Vec<(String, ItemDescriptor)>, StoreError> {
    let raw = backend.get_all(kind).await?;
    let data_kind = data_kind_for(kind);
    raw.into_iter()
        .map(|(k, v)| from_serialized(data_kind.as_ref(), &v).map(|item| (k, item)).map_err(StoreError::from))
        .collect()
}

/// Wraps a [`PersistentStoreCore`] backend with the caching, single-flight
/// coalescing, and outage-tolerance behavior described in §4.4.
pub struct PersistentStoreWrapper {
    backend: Arc<dyn PersistentStoreCore>,
    config: WrapperConfig,
    caches: Arc<Mutex<Caches>>,
    initialized: AtomicFlag,
    item_flight: SingleFlight<(Kind, String), Result<ItemDescriptor, StoreError>>,
    all_flight: SingleFlight<Kind, Result<Vec<(String, ItemDescriptor)>, StoreError>>,
    status: Arc<StoreStatusManager>,
}

impl PersistentStoreWrapper {
    pub fn new(backend: Arc<dyn PersistentStoreCore>, config: WrapperConfig) -> Self {
        let status = StoreStatusManager::new(config.status_poll_interval);
        Self {
            backend,
            config,
            caches: Arc::new(Mutex::new(Caches::default())),
            initialized: AtomicFlag::new(false),
            item_flight: SingleFlight::new(),
            all_flight: SingleFlight::new(),
            status,
        }
    }

    /// Current availability as last published by the status manager (§4.4.6).
    pub fn status(&self) -> StoreStatus {
        self.status.status()
    }

    /// Subscribes to availability transitions (§4.4.6).
    pub fn subscribe_status(&self) -> flagcore_concurrent::Listener<StoreStatus> {
        self.status.subscribe()
    }

    /// The status manager backing this wrapper, for callers that need to
    /// hand it to another component (e.g. a segments status façade) rather
    /// than just reading or subscribing to it.
    pub fn status_manager(&self) -> Arc<StoreStatusManager> {
        self.status.clone()
    }

    fn negative_probe_ttl(&self) -> Duration {
        match self.config.cache_ttl {
            CacheTtl::Finite(d) => d,
            CacheTtl::Infinite => self.config.status_poll_interval,
            CacheTtl::Disabled => Duration::ZERO,
        }
    }

    fn cached_item(&self, kind: Kind, key: &str) -> Option<ItemDescriptor> {
        let guard = self.caches.lock().expect("cache lock poisoned");
        guard
            .items
            .get(&(kind, key.to_owned()))
            .filter(|entry| is_fresh(entry.inserted_at, self.config.cache_ttl))
            .map(|entry| entry.item.clone())
    }

    fn store_item(&self, kind: Kind, key: &str, item: ItemDescriptor) {
        if matches!(self.config.cache_ttl, CacheTtl::Disabled) {
            return;
        }
        let mut guard = self.caches.lock().expect("cache lock poisoned");
        guard.items.insert(
            (kind, key.to_owned()),
            ItemEntry {
                item,
                inserted_at: Instant::now(),
            },
        );
    }

    fn cached_all(&self, kind: Kind) -> Option<Vec<(String, ItemDescriptor)>> {
        let guard = self.caches.lock().expect("cache lock poisoned");
        guard.all.get(&kind).filter(|entry| is_fresh(entry.inserted_at, self.config.cache_ttl)).map(|entry| {
            entry.items.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        })
    }

    fn store_all(&self, kind: Kind, items: Vec<(String, ItemDescriptor)>) {
        if matches!(self.config.cache_ttl, CacheTtl::Disabled) {
            return;
        }
        let mut guard = self.caches.lock().expect("cache lock poisoned");
        guard.all.insert(
            kind,
            AllEntry {
                items: items.into_iter().collect(),
                inserted_at: Instant::now(),
            },
        );
    }

    fn invalidate_all(&self, kind: Kind) {
        self.caches.lock().expect("cache lock poisoned").all.remove(&kind);
    }

    /// Merges a single write into the cached "all items" map in place
    /// (infinite-TTL only, §4.4.3): readers keep seeing consistent data
    /// through an outage instead of losing the whole map to invalidation.
    fn merge_into_all(&self, kind: Kind, key: &str, item: ItemDescriptor) {
        let mut guard = self.caches.lock().expect("cache lock poisoned");
        if let Some(entry) = guard.all.get_mut(&kind) {
            if item.is_tombstone() || item.is_not_found() {
                entry.items.remove(key);
            } else {
                entry.items.insert(key.to_owned(), item);
            }
        }
    }

    /// Builds the closure the status manager polls during an outage
    /// (§4.4.5): a liveness probe, plus (under infinite-TTL) a reseed of
    /// the backend from whatever the cache currently holds.
    fn recovery_probe(&self) -> super::status::RecoveryProbe {
        let backend = self.backend.clone();
        let caches = self.caches.clone();
        let cache_ttl = self.config.cache_ttl;
        Arc::new(move || {
            let backend = backend.clone();
            let caches = caches.clone();
            Box::pin(async move {
                if !backend.is_available().await {
                    return None;
                }
                if cache_ttl != CacheTtl::Infinite {
                    return Some(StoreStatus {
                        available: true,
                        needs_refresh: true,
                    });
                }
                // Reseed from the per-item cache, not the per-kind "all items"
                // cache: `all` entries only exist once a `get_all`/`init` has
                // run, but an infinite-TTL write-behind flow may consist of
                // nothing but `upsert` calls (§4.4.3, S5), which only ever
                // populate `caches.items`. Reseeding from `all` would silently
                // drop every write-behind value that never passed through
                // `get_all`.
                let collections: Vec<_> = {
                    let guard = caches.lock().expect("cache lock poisoned");
                    let mut by_kind: HashMap<Kind, Vec<(String, ItemDescriptor)>> = HashMap::new();
                    for ((kind, key), entry) in &guard.items {
                        by_kind.entry(*kind).or_default().push((key.clone(), entry.item.clone()));
                    }
                    by_kind
                        .into_iter()
                        .map(|(kind, items)| {
                            let data_kind = data_kind_for(kind);
                            let serialized = items
                                .into_iter()
                                .map(|(k, v)| (k, to_serialized(data_kind.as_ref(), &v)))
                                .collect();
                            (kind, serialized)
                        })
                        .collect()
                };
                match backend.init_collections(collections).await {
                    Ok(()) => Some(StoreStatus {
                        available: true,
                        needs_refresh: false,
                    }),
                    Err(_) => None,
                }
            }) as BoxFuture<'static, Option<StoreStatus>>
        })
    }

    async fn note_failure(&self) {
        let probe = self.recovery_probe();
        self.status.mark_unavailable(probe).await;
    }
}

impl DataStore for PersistentStoreWrapper {
    fn init(&self, collections: Vec<Collection>) -> BoxFuture<'_, Result<(), StoreError>> {
        async move {
            let ordered = order_collections(collections);
            let serialized: Vec<_> = ordered
                .iter()
                .map(|(kind, items)| {
                    let data_kind = data_kind_for(*kind);
                    let items = items
                        .iter()
                        .map(|(k, v)| (k.clone(), to_serialized(data_kind.as_ref(), v)))
                        .collect();
                    (*kind, items)
                })
                .collect();

            let result = self.backend.init_collections(serialized).await;
            {
                let mut guard = self.caches.lock().expect("cache lock poisoned");
                guard.items.clear();
                guard.all.clear();
                guard.init_checked_false_at = None;
            }

            let infinite = matches!(self.config.cache_ttl, CacheTtl::Infinite);
            let backend_ok = result.is_ok();

            if backend_ok || infinite {
                if !matches!(self.config.cache_ttl, CacheTtl::Disabled) {
                    for (kind, items) in &ordered {
                        self.store_all(*kind, filter_tombstones(items.clone()));
                        for (key, item) in items {
                            self.store_item(*kind, key, item.clone());
                        }
                    }
                }
                self.initialized.set();
            }

            match result {
                Ok(()) => {
                    debug!(collections = ordered.len(), "store initialized");
                    Ok(())
                }
                Err(e) => {
                    self.note_failure().await;
                    if infinite {
                        warn!("init against backend failed; proceeding on cached data (infinite-TTL)");
                        Ok(())
                    } else {
                        Err(e)
                    }
                }
            }
        }
        .boxed()
    }

    fn get<'a>(&'a self, kind: Kind, key: &'a str) -> BoxFuture<'a, Result<ItemDescriptor, StoreError>> {
        async move {
            if matches!(self.config.cache_ttl, CacheTtl::Disabled) {
                let result = backend_get(self.backend.clone(), kind, key.to_owned()).await;
                if result.is_err() {
                    self.note_failure().await;
                }
                return result;
            }

            if let Some(item) = self.cached_item(kind, key) {
                debug!(%kind, key, "item cache hit");
                return Ok(item);
            }

            let backend = self.backend.clone();
            let owned_key = key.to_owned();
            let result = self
                .item_flight
                .run((kind, owned_key.clone()), move || backend_get(backend, kind, owned_key))
                .await;

            match &result {
                Ok(item) => self.store_item(kind, key, item.clone()),
                Err(_) => self.note_failure().await,
            }
            result
        }
        .boxed()
    }

    fn get_all(&self, kind: Kind) -> BoxFuture<'_, Result<Vec<(String, ItemDescriptor)>, StoreError>> {
        async move {
            if matches!(self.config.cache_ttl, CacheTtl::Disabled) {
                let result = backend_get_all(self.backend.clone(), kind).await;
                if result.is_err() {
                    self.note_failure().await;
                }
                return result.map(filter_tombstones);
            }

            if let Some(items) = self.cached_all(kind) {
                debug!(%kind, "all-items cache hit");
                return Ok(items);
            }

            let backend = self.backend.clone();
            let result = self.all_flight.run(kind, move || backend_get_all(backend, kind)).await;
            match result {
                Ok(items) => {
                    let filtered = filter_tombstones(items);
                    self.store_all(kind, filtered.clone());
                    Ok(filtered)
                }
                Err(e) => {
                    self.note_failure().await;
                    Err(e)
                }
            }
        }
        .boxed()
    }

    fn upsert<'a>(
        &'a self,
        kind: Kind,
        key: &'a str,
        item: ItemDescriptor,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        async move {
            let data_kind = data_kind_for(kind);
            let serialized = to_serialized(data_kind.as_ref(), &item);
            let result = self.backend.upsert(kind, key, serialized).await;
            match result {
                Ok(updated) => {
                    if updated {
                        self.store_item(kind, key, item.clone());
                        match self.config.cache_ttl {
                            CacheTtl::Finite(_) => self.invalidate_all(kind),
                            CacheTtl::Infinite => self.merge_into_all(kind, key, item),
                            CacheTtl::Disabled => {}
                        }
                    }
                    Ok(updated)
                }
                Err(e) => {
                    self.note_failure().await;
                    if matches!(self.config.cache_ttl, CacheTtl::Infinite) {
                        self.store_item(kind, key, item.clone());
                        self.merge_into_all(kind, key, item);
                        warn!(%kind, key, "backend upsert failed; cached anyway for write-behind replay on recovery");
                    }
                    Err(e)
                }
            }
        }
        .boxed()
    }

    fn is_initialized(&self) -> BoxFuture<'_, bool> {
        async move {
            if self.initialized.get() {
                return true;
            }
            {
                let guard = self.caches.lock().expect("cache lock poisoned");
                if let Some(at) = guard.init_checked_false_at {
                    if at.elapsed() < self.negative_probe_ttl() {
                        return false;
                    }
                }
            }
            if self.backend.is_initialized().await {
                self.initialized.set();
                self.caches.lock().expect("cache lock poisoned").init_checked_false_at = None;
                true
            } else {
                self.caches.lock().expect("cache lock poisoned").init_checked_false_at = Some(Instant::now());
                false
            }
        }
        .boxed()
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        true
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            self.status.close().await;
            self.backend.close().await;
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlagKind, FlagPayload, Payload};
    use crate::store::persistent_core::testing::FakeBackend;

    fn flag_item(version: i64, key: &str) -> ItemDescriptor {
        ItemDescriptor::present(
            version,
            Payload::Flag(FlagPayload {
                key: key.to_owned(),
                prerequisites: Vec::new(),
                rules: serde_json::json!({ "v": version }),
            }),
        )
    }

    fn wrapper(cache_ttl: CacheTtl) -> (Arc<FakeBackend>, PersistentStoreWrapper) {
        let backend = Arc::new(FakeBackend::new());
        let wrapper = PersistentStoreWrapper::new(
            backend.clone(),
            WrapperConfig {
                cache_ttl,
                status_poll_interval: Duration::from_millis(5),
            },
        );
        (backend, wrapper)
    }

    #[tokio::test]
    async fn disabled_cache_reads_backend_every_time() {
        let (backend, wrapper) = wrapper(CacheTtl::Disabled);
        wrapper.upsert(Kind::FLAGS, "a", flag_item(1, "a")).await.unwrap();
        assert_eq!(wrapper.get(Kind::FLAGS, "a").await.unwrap().version, 1);

        backend.force_write(Kind::FLAGS, "a", to_serialized(&FlagKind, &flag_item(2, "a")));
        assert_eq!(wrapper.get(Kind::FLAGS, "a").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn finite_ttl_serves_stale_reads_until_expiry() {
        let (backend, wrapper) = wrapper(CacheTtl::Finite(Duration::from_millis(20)));
        wrapper.upsert(Kind::FLAGS, "a", flag_item(1, "a")).await.unwrap();
        assert_eq!(wrapper.get(Kind::FLAGS, "a").await.unwrap().version, 1);

        backend.force_write(Kind::FLAGS, "a", to_serialized(&FlagKind, &flag_item(2, "a")));
        assert_eq!(wrapper.get(Kind::FLAGS, "a").await.unwrap().version, 1, "cache not yet expired");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(wrapper.get(Kind::FLAGS, "a").await.unwrap().version, 2, "cache expired, backend reread");
    }

    #[tokio::test]
    async fn finite_ttl_upsert_invalidates_all_items_cache() {
        let (_backend, wrapper) = wrapper(CacheTtl::Finite(Duration::from_secs(60)));
        wrapper.upsert(Kind::FLAGS, "a", flag_item(1, "a")).await.unwrap();
        let all = wrapper.get_all(Kind::FLAGS).await.unwrap();
        assert_eq!(all.len(), 1);

        wrapper.upsert(Kind::FLAGS, "b", flag_item(1, "b")).await.unwrap();
        let all = wrapper.get_all(Kind::FLAGS).await.unwrap();
        assert_eq!(all.len(), 2, "invalidated all-items entry must be re-read from backend");
    }

    #[tokio::test]
    async fn infinite_ttl_merges_write_into_all_items_cache_in_place() {
        let (_backend, wrapper) = wrapper(CacheTtl::Infinite);
        wrapper.upsert(Kind::FLAGS, "a", flag_item(1, "a")).await.unwrap();
        let all = wrapper.get_all(Kind::FLAGS).await.unwrap();
        assert_eq!(all.len(), 1);

        wrapper.upsert(Kind::FLAGS, "b", flag_item(1, "b")).await.unwrap();
        let all = wrapper.get_all(Kind::FLAGS).await.unwrap();
        assert_eq!(all.len(), 2, "merged in place without a backend round-trip");
    }

    #[tokio::test]
    async fn get_all_excludes_tombstones_but_get_still_sees_them() {
        let (_backend, wrapper) = wrapper(CacheTtl::Disabled);
        wrapper.upsert(Kind::FLAGS, "a", flag_item(1, "a")).await.unwrap();
        wrapper.upsert(Kind::FLAGS, "b", ItemDescriptor::tombstone(2)).await.unwrap();

        let all = wrapper.get_all(Kind::FLAGS).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "a");

        assert!(wrapper.get(Kind::FLAGS, "b").await.unwrap().is_tombstone());
    }

    // S5 — write-behind across a backend outage, infinite-TTL.
    #[tokio::test]
    async fn infinite_ttl_write_behind_survives_backend_outage() {
        let (backend, wrapper) = wrapper(CacheTtl::Infinite);
        wrapper.upsert(Kind::FLAGS, "a", flag_item(1, "a")).await.unwrap();

        backend.set_available(false);
        let result = wrapper.upsert(Kind::FLAGS, "a", flag_item(2, "a")).await;
        assert!(result.is_err(), "backend is down, the write itself still fails");
        assert_eq!(
            wrapper.get(Kind::FLAGS, "a").await.unwrap().version,
            2,
            "cache reflects the write-behind value despite the outage"
        );
        assert!(!wrapper.status().available);
    }

    #[tokio::test]
    async fn outage_then_recovery_publishes_availability() {
        let (backend, wrapper) = wrapper(CacheTtl::Finite(Duration::from_secs(60)));
        backend.set_available(false);
        let mut listener = wrapper.subscribe_status();
        assert!(wrapper.get(Kind::FLAGS, "a").await.is_err());
        assert_eq!(
            listener.recv().await,
            Some(StoreStatus {
                available: false,
                needs_refresh: false
            })
        );
        backend.set_available(true);
        let recovered = tokio::time::timeout(Duration::from_secs(1), listener.recv())
            .await
            .expect("recovery should publish");
        assert_eq!(
            recovered,
            Some(StoreStatus {
                available: true,
                needs_refresh: true
            })
        );
    }

    #[tokio::test]
    async fn is_initialized_damps_repeated_false_probes() {
        let (_backend, wrapper) = wrapper(CacheTtl::Finite(Duration::from_secs(60)));
        assert!(!wrapper.is_initialized().await);
        assert!(!wrapper.is_initialized().await, "second call should hit the negative cache, not re-probe");
    }

    #[tokio::test]
    async fn init_reorders_segments_before_flags_for_the_backend() {
        let (backend, wrapper) = wrapper(CacheTtl::Disabled);
        wrapper
            .init(vec![
                (Kind::FLAGS, vec![("a".to_owned(), flag_item(1, "a"))]),
                (Kind::SEGMENTS, vec![]),
            ])
            .await
            .unwrap();
        assert!(backend.is_initialized().await);
        assert!(wrapper.is_initialized().await);
    }

    #[tokio::test]
    async fn concurrent_get_misses_for_the_same_key_single_flight() {
        let (_backend, wrapper) = wrapper(CacheTtl::Finite(Duration::from_secs(60)));
        wrapper.upsert(Kind::FLAGS, "a", flag_item(1, "a")).await.unwrap();
        let wrapper = Arc::new(wrapper);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let wrapper = wrapper.clone();
            handles.push(tokio::spawn(async move { wrapper.get(Kind::FLAGS, "a").await.unwrap().version }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }
    }
}
