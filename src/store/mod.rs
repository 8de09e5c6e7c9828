//! The store layer: the in-memory authority (§4.2), the narrow contract a
//! persistent backend must satisfy (§4.3), the caching wrapper that turns
//! a [`PersistentStoreCore`] into a full [`DataStore`] (§4.4), and the
//! status manager that tracks backend availability (§4.5).

mod memory;
mod persistent_core;
mod status;
mod wrapper;

pub use memory::InMemoryStore;
pub use persistent_core::PersistentStoreCore;
#[cfg(any(test, feature = "test-support"))]
pub use persistent_core::testing;
pub use status::{StoreStatus, StoreStatusManager};
pub use wrapper::{CacheTtl, PersistentStoreWrapper, WrapperConfig};

use futures::future::BoxFuture;

use crate::error::StoreError;
use crate::model::{Collection, ItemDescriptor, Kind};

/// Shared surface presented by both the in-memory store and the caching
/// wrapper over a persistent backend (§4.2, §4.4). Uses hand-rolled boxed
/// futures rather than `async-trait`, since no such crate is in the
/// teacher's dependency stack and the surface here is small.
pub trait DataStore: Send + Sync {
    fn init(&self, collections: Vec<Collection>) -> BoxFuture<'_, Result<(), StoreError>>;

    fn get<'a>(&'a self, kind: Kind, key: &'a str) -> BoxFuture<'a, Result<ItemDescriptor, StoreError>>;

    fn get_all(&self, kind: Kind) -> BoxFuture<'_, Result<Vec<(String, ItemDescriptor)>, StoreError>>;

    fn upsert<'a>(
        &'a self,
        kind: Kind,
        key: &'a str,
        item: ItemDescriptor,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn is_initialized(&self) -> BoxFuture<'_, bool>;

    fn is_status_monitoring_enabled(&self) -> bool;

    fn close(&self) -> BoxFuture<'_, ()>;
}
