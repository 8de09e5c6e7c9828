//! Flag-change notification (§4.8): a key-level change feed, plus
//! per-subscription value-change listeners built on top of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use flagcore_concurrent::{Broadcaster, Listener};
use tracing::debug;

use crate::model::{ItemDescriptor, Payload};

/// One changed flag key. The updater publishes one of these per flag that
/// was added, removed, or updated, plus every flag transitively reachable
/// through the prerequisite DAG from that change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlagChangeEvent {
    pub key: String,
}

/// A flag's evaluated value changed across a re-evaluation triggered by a
/// matching [`FlagChangeEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlagValueChangeEvent {
    pub key: String,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// Publishes flag-change events and derives value-change subscriptions
/// from them. Evaluation itself is out of scope for this crate (§6); a
/// value-change listener is handed a re-evaluation closure by its caller
/// (the evaluator-owning layer), since no `Evaluator` trait is defined
/// here.
pub struct FlagTracker {
    broadcaster: Broadcaster<FlagChangeEvent>,
}

impl FlagTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            broadcaster: Broadcaster::new(),
        })
    }

    pub fn add_flag_change_listener(&self) -> Listener<FlagChangeEvent> {
        self.broadcaster.add_listener()
    }

    /// Publishes `direct_keys` plus every flag in `current_flags` whose
    /// prerequisite chain (possibly several hops deep) includes one of
    /// them.
    pub async fn publish_flag_changes(
        &self,
        direct_keys: impl IntoIterator<Item = String>,
        current_flags: &HashMap<String, ItemDescriptor>,
    ) {
        let mut changed: HashSet<String> = direct_keys.into_iter().collect();
        loop {
            let mut discovered = Vec::new();
            for (key, item) in current_flags {
                if changed.contains(key) {
                    continue;
                }
                let Some(flag) = item.as_present().and_then(Payload::as_flag) else {
                    continue;
                };
                if flag.prerequisites.iter().any(|p| changed.contains(p)) {
                    discovered.push(key.clone());
                }
            }
            if discovered.is_empty() {
                break;
            }
            changed.extend(discovered);
        }
        debug!(count = changed.len(), "publishing flag change events");
        for key in changed {
            self.broadcaster.broadcast(FlagChangeEvent { key }).await;
        }
    }

    /// A changed segment may affect any flag whose rules reference it, but
    /// rules are opaque JSON this crate does not parse (§3): there is no
    /// general way to derive segment->flag edges from the model alone. As
    /// a conservative resolution, every currently known flag is reported
    /// changed, satisfying §4.8's "reachable from a changed segment"
    /// requirement without rule introspection this crate does not own.
    pub async fn publish_segment_change_affecting_all(&self, current_flag_keys: impl IntoIterator<Item = String>) {
        for key in current_flag_keys {
            self.broadcaster.broadcast(FlagChangeEvent { key }).await;
        }
    }

    /// Spawns a task that subscribes to flag-change events for `key`,
    /// re-evaluates via `evaluate` on each match, and emits a
    /// [`FlagValueChangeEvent`] only when the value actually changed.
    /// Dropping the returned subscription cancels the task, which in turn
    /// drops its inner flag-change listener.
    pub fn add_flag_value_change_listener(
        self: &Arc<Self>,
        key: String,
        evaluate: Arc<dyn Fn() -> serde_json::Value + Send + Sync>,
    ) -> ValueChangeSubscription {
        let mut change_listener = self.add_flag_change_listener();
        let value_broadcaster = Arc::new(Broadcaster::<FlagValueChangeEvent>::new());
        let out_listener = value_broadcaster.add_listener();
        let task_broadcaster = value_broadcaster.clone();
        let initial = evaluate();
        let watched_key = key.clone();

        let task = tokio::spawn(async move {
            let mut current = initial;
            while let Some(event) = change_listener.recv().await {
                if event.key != watched_key {
                    continue;
                }
                let new_value = evaluate();
                if new_value != current {
                    let changed = FlagValueChangeEvent {
                        key: watched_key.clone(),
                        old: current.clone(),
                        new: new_value.clone(),
                    };
                    current = new_value;
                    task_broadcaster.broadcast(changed).await;
                }
            }
            task_broadcaster.close();
        });

        ValueChangeSubscription {
            listener: out_listener,
            task,
        }
    }

    /// Releases every subscriber. Value-change tasks learn of this the
    /// next time they try to receive from a closed channel.
    pub fn close(&self) {
        self.broadcaster.close();
    }
}

/// Handle for a single `add_flag_value_change_listener` subscription.
/// Dropping it aborts the backing task, unsubscribing its internal
/// flag-change listener.
pub struct ValueChangeSubscription {
    listener: Listener<FlagValueChangeEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl ValueChangeSubscription {
    pub async fn recv(&mut self) -> Option<FlagValueChangeEvent> {
        self.listener.recv().await
    }
}

impl Drop for ValueChangeSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
