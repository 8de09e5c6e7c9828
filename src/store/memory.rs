use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use flagcore_concurrent::AtomicFlag;

use super::DataStore;
use crate::error::StoreError;
use crate::model::{Collection, ItemDescriptor, Kind};

/// The authoritative in-process store (§4.2). A single `RwLock` guards a
/// map-of-maps; every operation is linearizable with respect to every
/// other operation, and the lock is never held across an `.await` (there
/// is no I/O here to await on).
#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<HashMap<Kind, HashMap<String, ItemDescriptor>>>,
    initialized: AtomicFlag,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            initialized: AtomicFlag::new(false),
        }
    }
}

impl DataStore for InMemoryStore {
    fn init(&self, collections: Vec<Collection>) -> BoxFuture<'_, Result<(), StoreError>> {
        async move {
            let mut guard = self.data.write().expect("in-memory store lock poisoned");
            guard.clear();
            for (kind, items) in collections {
                let bucket = guard.entry(kind).or_default();
                for (key, item) in items {
                    bucket.insert(key, item);
                }
            }
            drop(guard);
            self.initialized.set();
            debug!("in-memory store initialized");
            Ok(())
        }
        .boxed()
    }

    fn get<'a>(&'a self, kind: Kind, key: &'a str) -> BoxFuture<'a, Result<ItemDescriptor, StoreError>> {
        async move {
            let guard = self.data.read().expect("in-memory store lock poisoned");
            let found = guard
                .get(&kind)
                .and_then(|bucket| bucket.get(key))
                .cloned();
            Ok(found.unwrap_or_else(ItemDescriptor::not_found))
        }
        .boxed()
    }

    fn get_all(&self, kind: Kind) -> BoxFuture<'_, Result<Vec<(String, ItemDescriptor)>, StoreError>> {
        async move {
            let guard = self.data.read().expect("in-memory store lock poisoned");
            let items = guard
                .get(&kind)
                .map(|bucket| {
                    bucket
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default();
            Ok(items)
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
            let mut guard = self.data.write().expect("in-memory store lock poisoned");
            let bucket = guard.entry(kind).or_default();
            let updated = match bucket.get(key) {
                Some(existing) if existing.version >= item.version => false,
                _ => {
                    bucket.insert(key.to_owned(), item);
                    true
                }
            };
            Ok(updated)
        }
        .boxed()
    }

    fn is_initialized(&self) -> BoxFuture<'_, bool> {
        async move { self.initialized.get() }.boxed()
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        false
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {}.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlagPayload, Payload};

    fn flag_item(version: i64, key: &str) -> ItemDescriptor {
        ItemDescriptor::present(
            version,
            Payload::Flag(FlagPayload {
                key: key.to_owned(),
                prerequisites: Vec::new(),
                rules: serde_json::json!({"v": version}),
            }),
        )
    }

    // S1 — In-memory upsert/get round-trip.
    #[tokio::test]
    async fn upsert_get_round_trip_respects_version_monotonicity() {
        let store = InMemoryStore::new();
        store
            .init(vec![(Kind::FLAGS, vec![("a".to_owned(), flag_item(1, "a"))])])
            .await
            .unwrap();
        let got = store.get(Kind::FLAGS, "a").await.unwrap();
        assert_eq!(got.version, 1);

        let updated = store.upsert(Kind::FLAGS, "a", flag_item(2, "a")).await.unwrap();
        assert!(updated);
        assert_eq!(store.get(Kind::FLAGS, "a").await.unwrap().version, 2);

        let stale = store
            .upsert(Kind::FLAGS, "a", flag_item(2, "a-stale"))
            .await
            .unwrap();
        assert!(!stale, "equal version must not overwrite");
        assert_eq!(
            store
                .get(Kind::FLAGS, "a")
                .await
                .unwrap()
                .item
                .unwrap()
                .as_flag()
                .unwrap()
                .rules,
            serde_json::json!({"v": 2})
        );
    }

    // S2 — Tombstone resurrection.
    #[tokio::test]
    async fn tombstone_then_resurrection_then_stale_write_is_noop() {
        let store = InMemoryStore::new();
        store
            .upsert(Kind::FLAGS, "x", ItemDescriptor::tombstone(5))
            .await
            .unwrap();
        assert!(store.get(Kind::FLAGS, "x").await.unwrap().is_tombstone());

        let resurrected = store.upsert(Kind::FLAGS, "x", flag_item(6, "x")).await.unwrap();
        assert!(resurrected);
        assert!(!store.get(Kind::FLAGS, "x").await.unwrap().is_tombstone());

        let stale = store.upsert(Kind::FLAGS, "x", flag_item(6, "x-new")).await.unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn get_on_unknown_key_returns_not_found_sentinel() {
        let store = InMemoryStore::new();
        let got = store.get(Kind::FLAGS, "nope").await.unwrap();
        assert!(got.is_not_found());
    }

    #[tokio::test]
    async fn get_all_on_unknown_kind_returns_empty() {
        let store = InMemoryStore::new();
        let got = store.get_all(Kind::new("unused")).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn get_all_includes_tombstones() {
        let store = InMemoryStore::new();
        store
            .init(vec![(
                Kind::FLAGS,
                vec![
                    ("a".to_owned(), flag_item(1, "a")),
                    ("b".to_owned(), ItemDescriptor::tombstone(2)),
                ],
            )])
            .await
            .unwrap();
        let all = store.get_all(Kind::FLAGS).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|(k, v)| k == "b" && v.is_tombstone()));
    }

    // Initialization stickiness.
    #[tokio::test]
    async fn is_initialized_is_sticky() {
        let store = InMemoryStore::new();
        assert!(!store.is_initialized().await);
        store.init(vec![]).await.unwrap();
        assert!(store.is_initialized().await);
        store.init(vec![]).await.unwrap();
        assert!(store.is_initialized().await);
    }

    #[tokio::test]
    async fn status_monitoring_is_disabled_for_in_memory_store() {
        let store = InMemoryStore::new();
        assert!(!store.is_status_monitoring_enabled());
    }

    #[tokio::test]
    async fn concurrent_upserts_converge_to_max_version() {
        use std::sync::Arc;
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for v in 1..=20i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(Kind::FLAGS, "k", flag_item(v, "k")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(Kind::FLAGS, "k").await.unwrap().version, 20);
    }
}
