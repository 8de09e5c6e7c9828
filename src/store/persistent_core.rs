use futures::future::BoxFuture;

use crate::error::StoreError;
use crate::model::{Kind, SerializedItemDescriptor};

/// The collections form handed to [`PersistentStoreCore::init_collections`]:
/// one ordered list per kind, in the order the caller wants them applied.
/// The caching wrapper is responsible for producing this order via the
/// dependency orderer (§4.6) before calling in; a backend that can apply
/// atomically is free to ignore the order.
pub type SerializedCollection = (Kind, Vec<(String, SerializedItemDescriptor)>);

/// The narrow contract a persistent backend must implement to be wrapped
/// by [`super::PersistentStoreWrapper`] (§4.3). The core speaks bytes only;
/// all codec work happens in the wrapper.
///
/// Concrete backends (a remote key-value database, etc.) are explicitly
/// out of scope for this crate (`spec.md` §1) — this trait is the contract
/// such a backend must satisfy, not an implementation of one.
pub trait PersistentStoreCore: Send + Sync {
    fn init_collections(&self, collections: Vec<SerializedCollection>) -> BoxFuture<'_, Result<(), StoreError>>;

    fn get<'a>(&'a self, kind: Kind, key: &'a str) -> BoxFuture<'a, Result<SerializedItemDescriptor, StoreError>>;

    fn get_all(&self, kind: Kind) -> BoxFuture<'_, Result<Vec<(String, SerializedItemDescriptor)>, StoreError>>;

    fn upsert<'a>(
        &'a self,
        kind: Kind,
        key: &'a str,
        item: SerializedItemDescriptor,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Detected via a sentinel record written during `init_collections`.
    /// The sentinel's namespace/key must be distinct from every real
    /// record namespace (§6).
    fn is_initialized(&self) -> BoxFuture<'_, bool>;

    /// Cheap liveness probe — a lookup of the sentinel, not a deep health
    /// check (§4.3).
    fn is_available(&self) -> BoxFuture<'_, bool>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Test-only in-memory stand-in for a real persistent backend, used by
/// this crate's own test suite for the wrapper (§4.4) and by integration
/// tests for the end-to-end scenarios in `spec.md` §8. Not part of the
/// public API: `spec.md` explicitly keeps concrete backends out of scope,
/// and this type exists purely to exercise [`PersistentStoreCore`] callers
/// without a real database.
#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::RwLock;

    #[derive(Default)]
    pub struct FakeBackend {
        data: RwLock<HashMap<Kind, HashMap<String, SerializedItemDescriptor>>>,
        initialized: AtomicBool,
        available: AtomicBool,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self {
                data: RwLock::new(HashMap::new()),
                initialized: AtomicBool::new(false),
                available: AtomicBool::new(true),
            }
        }

        /// Forces subsequent calls to fail, simulating a backend outage.
        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }

        /// Writes directly, bypassing the conditional-write check — used
        /// by tests that need to simulate an out-of-band write made while
        /// the wrapper's cache is stale (see scenario S4).
        pub fn force_write(&self, kind: Kind, key: &str, item: SerializedItemDescriptor) {
            self.data
                .write()
                .unwrap()
                .entry(kind)
                .or_default()
                .insert(key.to_owned(), item);
        }

        fn check_available(&self) -> Result<(), StoreError> {
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Backend("backend unavailable".to_owned()))
            }
        }
    }

    impl PersistentStoreCore for FakeBackend {
        fn init_collections(
            &self,
            collections: Vec<SerializedCollection>,
        ) -> BoxFuture<'_, Result<(), StoreError>> {
            Box::pin(async move {
                self.check_available()?;
                let mut guard = self.data.write().unwrap();
                guard.clear();
                for (kind, items) in collections {
                    let bucket = guard.entry(kind).or_default();
                    for (key, item) in items {
                        bucket.insert(key, item);
                    }
                }
                drop(guard);
                self.initialized.store(true, Ordering::SeqCst);
                Ok(())
            })
        }

        fn get<'a>(
            &'a self,
            kind: Kind,
            key: &'a str,
        ) -> BoxFuture<'a, Result<SerializedItemDescriptor, StoreError>> {
            Box::pin(async move {
                self.check_available()?;
                let guard = self.data.read().unwrap();
                Ok(guard
                    .get(&kind)
                    .and_then(|b| b.get(key))
                    .cloned()
                    .unwrap_or_else(SerializedItemDescriptor::not_found))
            })
        }

        fn get_all(
            &self,
            kind: Kind,
        ) -> BoxFuture<'_, Result<Vec<(String, SerializedItemDescriptor)>, StoreError>> {
            Box::pin(async move {
                self.check_available()?;
                let guard = self.data.read().unwrap();
                Ok(guard
                    .get(&kind)
                    .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default())
            })
        }

        fn upsert<'a>(
            &'a self,
            kind: Kind,
            key: &'a str,
            item: SerializedItemDescriptor,
        ) -> BoxFuture<'a, Result<bool, StoreError>> {
            Box::pin(async move {
                self.check_available()?;
                let mut guard = self.data.write().unwrap();
                let bucket = guard.entry(kind).or_default();
                let updated = match bucket.get(key) {
                    Some(existing) if existing.version >= item.version => false,
                    _ => {
                        bucket.insert(key.to_owned(), item);
                        true
                    }
                };
                Ok(updated)
            })
        }

        fn is_initialized(&self) -> BoxFuture<'_, bool> {
            Box::pin(async move { self.check_available().is_ok() && self.initialized.load(Ordering::SeqCst) })
        }

        fn is_available(&self) -> BoxFuture<'_, bool> {
            Box::pin(async move { self.available.load(Ordering::SeqCst) })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {})
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn conditional_write_rejects_equal_or_lower_version() {
            let backend = FakeBackend::new();
            let item_v2 = SerializedItemDescriptor {
                version: 2,
                deleted: false,
                bytes: b"v2".to_vec(),
            };
            assert!(backend.upsert(Kind::FLAGS, "a", item_v2).await.unwrap());
            let item_v2_again = SerializedItemDescriptor {
                version: 2,
                deleted: false,
                bytes: b"v2b".to_vec(),
            };
            assert!(!backend.upsert(Kind::FLAGS, "a", item_v2_again).await.unwrap());
        }

        #[tokio::test]
        async fn unavailable_backend_errors_every_call() {
            let backend = FakeBackend::new();
            backend.set_available(false);
            assert!(backend.get(Kind::FLAGS, "a").await.is_err());
            assert!(!backend.is_available().await);
        }
    }
}
