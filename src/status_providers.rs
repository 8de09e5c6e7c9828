//! Read-side status façades (component K, §4.4.6 / §4.7 / SPEC_FULL §4
//! supplement): thin wrappers that expose one status concern each instead
//! of handing every caller the full store/data-source managers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use flagcore_concurrent::Listener;

use crate::data_source::{DataSourceState, DataSourceStatus, DataSourceStatusManager};
use crate::store::{StoreStatus, StoreStatusManager};

/// Read-only façade over [`StoreStatusManager`] (§4.4.6).
pub struct DataStoreStatusProvider {
    manager: Arc<StoreStatusManager>,
}

impl DataStoreStatusProvider {
    pub fn new(manager: Arc<StoreStatusManager>) -> Self {
        Self { manager }
    }

    pub fn status(&self) -> StoreStatus {
        self.manager.status()
    }

    pub fn subscribe(&self) -> Listener<StoreStatus> {
        self.manager.subscribe()
    }
}

/// Read-only façade over [`DataSourceStatusManager`] (§4.7), including the
/// blocking `wait_for` a caller needs to await a specific state.
pub struct DataSourceStatusProvider {
    manager: Arc<DataSourceStatusManager>,
}

impl DataSourceStatusProvider {
    pub fn new(manager: Arc<DataSourceStatusManager>) -> Self {
        Self { manager }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.manager.status()
    }

    pub fn subscribe(&self) -> Listener<DataSourceStatus> {
        self.manager.subscribe()
    }

    pub async fn wait_for(&self, desired: DataSourceState, timeout: Duration) -> DataSourceState {
        self.manager.wait_for(desired, timeout).await
    }
}

/// Reports whether the `segment` kind specifically is populated and
/// current, independent of overall store/flag health — evaluators with
/// segment-referencing prerequisites need this distinction (SPEC_FULL §4).
///
/// [`DataSourceUpdater`](crate::data_source::DataSourceUpdater) calls
/// [`note_segment_write`](Self::note_segment_write) whenever it accepts a
/// write to the `segment` kind; absent any such write, segments are
/// considered not yet current even if the store itself is available.
pub struct UpstreamSegmentsStatusProvider {
    store_status: Arc<StoreStatusManager>,
    last_write: Mutex<Option<DateTime<Utc>>>,
}

impl UpstreamSegmentsStatusProvider {
    pub fn new(store_status: Arc<StoreStatusManager>) -> Arc<Self> {
        Arc::new(Self {
            store_status,
            last_write: Mutex::new(None),
        })
    }

    pub fn note_segment_write(&self) {
        *self.last_write.lock().expect("segment status lock poisoned") = Some(Utc::now());
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self.last_write.lock().expect("segment status lock poisoned")
    }

    /// Segments are current only once at least one write has landed and
    /// the store backing them is currently available.
    pub fn is_current(&self) -> bool {
        self.store_status.status().available && self.last_updated().is_some()
    }
}
