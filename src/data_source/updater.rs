//! Drives store writes on behalf of an upstream data source, translating
//! write outcomes into state-machine transitions and flag-change events
//! (§4.7).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use flagcore_concurrent::{Broadcaster, Listener};

use super::state::{requested_state_for_error, DataSourceState, DataSourceStatus, DataSourceStatusManager, ErrorInfo};
use crate::error::SourceErrorKind;
use crate::flag_tracker::FlagTracker;
use crate::model::{Collection, ItemDescriptor, Kind};
use crate::status_providers::UpstreamSegmentsStatusProvider;
use crate::store::{DataStore, StoreStatus};

/// Coordinates writes from an upstream data source into a [`DataStore`]:
/// reorders and forwards `init`/`upsert` calls, drives the data-source
/// state machine from the outcome, diffs against the prior contents to
/// publish flag-change events, and nudges the upstream to resynchronize
/// after a store outage recovers.
pub struct DataSourceUpdater {
    store: Arc<dyn DataStore>,
    status: Arc<DataSourceStatusManager>,
    flag_tracker: Arc<FlagTracker>,
    refresh_signal: Broadcaster<()>,
    last_logged_error: Mutex<Option<SourceErrorKind>>,
    refresh_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    segments_status: Mutex<Option<Arc<UpstreamSegmentsStatusProvider>>>,
}

impl DataSourceUpdater {
    pub fn new(store: Arc<dyn DataStore>, flag_tracker: Arc<FlagTracker>) -> Arc<Self> {
        Arc::new(Self {
            store,
            status: DataSourceStatusManager::new(),
            flag_tracker,
            refresh_signal: Broadcaster::new(),
            last_logged_error: Mutex::new(None),
            refresh_task: Mutex::new(None),
            segments_status: Mutex::new(None),
        })
    }

    /// Wires a segments-status façade so every accepted write to the
    /// `segment` kind marks it current (SPEC_FULL §4, component K).
    pub fn set_segments_status_provider(&self, provider: Arc<UpstreamSegmentsStatusProvider>) {
        *self.segments_status.lock().expect("updater segments status lock poisoned") = Some(provider);
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.status()
    }

    pub fn subscribe_status(&self) -> Listener<DataSourceStatus> {
        self.status.subscribe()
    }

    /// Blocks until the state machine enters `desired`, terminates, or
    /// `timeout` elapses (§4.7).
    pub async fn wait_for(&self, desired: DataSourceState, timeout: Duration) -> DataSourceState {
        self.status.wait_for(desired, timeout).await
    }

    /// The upstream data source subscribes here to learn when it must
    /// restart from a full refresh (§4.4.5, §4.7).
    pub fn subscribe_refresh_signal(&self) -> Listener<()> {
        self.refresh_signal.add_listener()
    }

    /// Watches store-status transitions and signals the upstream whenever
    /// the store recovers needing a refresh. The caller is expected to
    /// obtain `listener` from the same [`crate::store::StoreStatusManager`]
    /// guarding the store this updater writes to.
    pub async fn watch_store_status(self: &Arc<Self>, mut listener: Listener<StoreStatus>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(status) = listener.recv().await {
                if status.available && status.needs_refresh {
                    debug!("store recovered needing refresh; signalling upstream");
                    this.refresh_signal.broadcast(()).await;
                }
            }
        });
        *self.refresh_task.lock().expect("updater refresh task lock poisoned") = Some(handle);
    }

    /// Reorders `collections` and writes them to the store (§4.6, §4.7).
    /// Diffs against the store's prior contents to publish flag-change
    /// events for whatever actually changed.
    pub async fn init(&self, collections: Vec<Collection>) -> bool {
        let previous = self.snapshot(collections.iter().map(|(k, _)| *k)).await;
        match self.store.init(collections.clone()).await {
            Ok(()) => {
                self.note_success();
                self.status.update_status(DataSourceState::Valid, None).await;
                self.publish_init_diffs(&previous, &collections).await;
                true
            }
            Err(e) => {
                self.note_failure(e.into()).await;
                false
            }
        }
    }

    /// Writes a single record and, if it actually took effect, publishes
    /// the resulting flag-change events (§4.7, §4.8).
    pub async fn upsert(&self, kind: Kind, key: &str, item: ItemDescriptor) -> bool {
        match self.store.upsert(kind, key, item).await {
            Ok(updated) => {
                self.note_success();
                self.status.update_status(DataSourceState::Valid, None).await;
                if updated {
                    self.publish_single_change(kind, key).await;
                }
                updated
            }
            Err(e) => {
                self.note_failure(e.into()).await;
                false
            }
        }
    }

    /// Lets an upstream data source drive the state machine directly —
    /// e.g. a successful incremental update with no store write of its
    /// own, or a hard upstream failure that the store layer never saw.
    pub async fn update_status(&self, state: DataSourceState, error: Option<SourceErrorKind>) {
        let error_info = error.map(|kind| ErrorInfo { kind, time: Utc::now() });
        self.status.update_status(state, error_info).await;
    }

    /// Stops the store-status watcher and transitions to `Off`.
    pub async fn close(&self) {
        if let Some(handle) = self.refresh_task.lock().expect("updater refresh task lock poisoned").take() {
            handle.abort();
        }
        self.status.close().await;
    }

    async fn snapshot(&self, kinds: impl Iterator<Item = Kind>) -> HashMap<Kind, HashMap<String, ItemDescriptor>> {
        let mut map = HashMap::new();
        for kind in kinds {
            if let Ok(items) = self.store.get_all(kind).await {
                map.insert(kind, items.into_iter().collect());
            }
        }
        map
    }

    async fn publish_init_diffs(
        &self,
        previous: &HashMap<Kind, HashMap<String, ItemDescriptor>>,
        collections: &[Collection],
    ) {
        for (kind, items) in collections {
            let new_map: HashMap<String, ItemDescriptor> = items.iter().cloned().collect();
            let empty = HashMap::new();
            let old_map = previous.get(kind).unwrap_or(&empty);
            let mut changed_keys: Vec<String> = new_map
                .iter()
                .filter(|(k, v)| old_map.get(k.as_str()) != Some(v))
                .map(|(k, _)| k.clone())
                .collect();
            changed_keys.extend(old_map.keys().filter(|k| !new_map.contains_key(k.as_str())).cloned());
            if changed_keys.is_empty() {
                continue;
            }
            self.publish_kind_change(*kind, changed_keys, &new_map).await;
        }
    }

    async fn publish_single_change(&self, kind: Kind, key: &str) {
        let current_flags = self.store.get_all(Kind::FLAGS).await.unwrap_or_default();
        let flag_map: HashMap<String, ItemDescriptor> = current_flags.into_iter().collect();
        self.publish_kind_change(kind, vec![key.to_owned()], &flag_map).await;
    }

    async fn publish_kind_change(&self, kind: Kind, changed_keys: Vec<String>, flag_map: &HashMap<String, ItemDescriptor>) {
        if kind == Kind::FLAGS {
            self.flag_tracker.publish_flag_changes(changed_keys, flag_map).await;
        } else if kind == Kind::SEGMENTS {
            if let Some(provider) = self.segments_status.lock().expect("updater segments status lock poisoned").clone() {
                provider.note_segment_write();
            }
            let keys = if flag_map.is_empty() {
                self.store.get_all(Kind::FLAGS).await.unwrap_or_default().into_iter().map(|(k, _)| k).collect()
            } else {
                flag_map.keys().cloned().collect::<Vec<_>>()
            };
            self.flag_tracker.publish_segment_change_affecting_all(keys).await;
        }
    }

    fn note_success(&self) {
        *self.last_logged_error.lock().expect("updater error lock poisoned") = None;
    }

    async fn note_failure(&self, kind: SourceErrorKind) {
        let requested = requested_state_for_error(&kind);
        let should_log = {
            let mut guard = self.last_logged_error.lock().expect("updater error lock poisoned");
            let should_log = guard.as_ref() != Some(&kind);
            if should_log {
                *guard = Some(kind.clone());
            }
            should_log
        };
        if should_log {
            warn!(error = %kind, "store rejected write from data source");
        } else {
            debug!(error = %kind, "repeated store failure suppressed from logs");
        }
        self.status.update_status(requested, Some(ErrorInfo { kind, time: Utc::now() })).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlagPayload, Payload};
    use crate::store::InMemoryStore;

    fn flag_item(version: i64, key: &str, prereqs: &[&str]) -> ItemDescriptor {
        ItemDescriptor::present(
            version,
            Payload::Flag(FlagPayload {
                key: key.to_owned(),
                prerequisites: prereqs.iter().map(|s| s.to_string()).collect(),
                rules: serde_json::json!({}),
            }),
        )
    }

    fn updater() -> Arc<DataSourceUpdater> {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
        DataSourceUpdater::new(store, FlagTracker::new())
    }

    #[tokio::test]
    async fn successful_init_transitions_to_valid() {
        let updater = updater();
        assert!(updater.init(vec![(Kind::FLAGS, vec![("a".to_owned(), flag_item(1, "a", &[]))])]).await);
        assert_eq!(updater.status().state, DataSourceState::Valid);
    }

    #[tokio::test]
    async fn init_publishes_change_events_for_new_and_updated_keys() {
        let updater = updater();
        let mut listener = updater.flag_tracker.add_flag_change_listener();
        updater
            .init(vec![(Kind::FLAGS, vec![("a".to_owned(), flag_item(1, "a", &[]))])])
            .await;
        assert_eq!(listener.recv().await.unwrap().key, "a");

        updater
            .init(vec![(Kind::FLAGS, vec![("a".to_owned(), flag_item(2, "a", &[]))])])
            .await;
        assert_eq!(listener.recv().await.unwrap().key, "a");
    }

    #[tokio::test]
    async fn upsert_publishes_transitive_dependents() {
        let updater = updater();
        updater
            .init(vec![(
                Kind::FLAGS,
                vec![
                    ("a".to_owned(), flag_item(1, "a", &["b"])),
                    ("b".to_owned(), flag_item(1, "b", &[])),
                ],
            )])
            .await;
        let mut listener = updater.flag_tracker.add_flag_change_listener();
        updater.upsert(Kind::FLAGS, "b", flag_item(2, "b", &[])).await;

        let mut seen = std::collections::HashSet::new();
        seen.insert(listener.recv().await.unwrap().key);
        seen.insert(listener.recv().await.unwrap().key);
        assert_eq!(seen, std::collections::HashSet::from(["a".to_owned(), "b".to_owned()]));
    }

    #[tokio::test]
    async fn wait_for_blocks_until_valid_after_init() {
        let updater = updater();
        let waiter = {
            let updater = updater.clone();
            tokio::spawn(async move { updater.wait_for(DataSourceState::Valid, Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;
        updater.init(vec![]).await;
        assert_eq!(waiter.await.unwrap(), DataSourceState::Valid);
    }

    #[tokio::test]
    async fn unrecoverable_update_status_call_terminates_the_machine() {
        let updater = updater();
        updater
            .update_status(DataSourceState::Off, Some(SourceErrorKind::ErrorResponse(401)))
            .await;
        assert_eq!(updater.status().state, DataSourceState::Off);
    }

    #[tokio::test]
    async fn accepted_segment_write_notes_the_segments_status_provider() {
        let updater = updater();
        let store_status = crate::store::StoreStatusManager::with_default_interval();
        let provider = crate::status_providers::UpstreamSegmentsStatusProvider::new(store_status);
        updater.set_segments_status_provider(provider.clone());

        assert!(!provider.is_current());
        updater
            .init(vec![(
                Kind::SEGMENTS,
                vec![(
                    "s".to_owned(),
                    ItemDescriptor::present(
                        1,
                        Payload::Segment(crate::model::SegmentPayload {
                            key: "s".to_owned(),
                            rules: serde_json::json!({}),
                        }),
                    ),
                )],
            )])
            .await;
        assert!(provider.is_current());
    }

    #[tokio::test]
    async fn refresh_signal_fires_when_store_recovers_needing_refresh() {
        let updater = updater();
        let mut refresh = updater.subscribe_refresh_signal();
        let store_status_mgr = crate::store::StoreStatusManager::with_default_interval();
        updater.watch_store_status(store_status_mgr.subscribe()).await;

        store_status_mgr.update_availability(false, false).await;
        store_status_mgr.update_availability(true, true).await;

        tokio::time::timeout(Duration::from_secs(1), refresh.recv())
            .await
            .expect("refresh signal should fire")
            .expect("channel open");
    }
}
