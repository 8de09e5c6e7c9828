//! The data-source state machine (§4.7): distinct from store-availability
//! state, this tracks whether the upstream connection has ever produced a
//! full data set and, if so, whether it is currently healthy.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use flagcore_concurrent::{Broadcaster, Listener};

use crate::error::SourceErrorKind;

/// The data-source's own health state, published alongside the store's
/// availability state but tracked independently (§4.7 distinguishes the
/// two explicitly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSourceState {
    /// Never yet received a full data set.
    Initializing,
    /// Received at least one complete data set; currently healthy.
    Valid,
    /// Was previously `Valid`; encountered an error and is retrying.
    Interrupted,
    /// Terminal: closed, or hit an unrecoverable error.
    Off,
}

/// The error that drove the most recent status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub kind: SourceErrorKind,
    pub time: DateTime<Utc>,
}

/// Published snapshot: current state plus the most recent error, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    pub last_error: Option<ErrorInfo>,
}

impl DataSourceStatus {
    pub fn initial() -> Self {
        Self {
            state: DataSourceState::Initializing,
            last_error: None,
        }
    }
}

/// Which target state an error maps to: unrecoverable upstream failures
/// (401/403) are terminal; everything else is a retryable interruption.
pub fn requested_state_for_error(kind: &SourceErrorKind) -> DataSourceState {
    if kind.is_unrecoverable() {
        DataSourceState::Off
    } else {
        DataSourceState::Interrupted
    }
}

/// Applies the transition table's coercion rule (§4.7): `Off` is terminal,
/// and a request to enter `Interrupted` while still `Initializing` is
/// coerced back to `Initializing` so a startup retry never looks like a
/// regression from a prior healthy state that never existed.
fn coerce(current: DataSourceState, requested: DataSourceState) -> DataSourceState {
    match (current, requested) {
        (DataSourceState::Off, _) => DataSourceState::Off,
        (DataSourceState::Initializing, DataSourceState::Interrupted) => DataSourceState::Initializing,
        (_, requested) => requested,
    }
}

/// Owns the data-source state and publishes transitions via a broadcaster.
pub struct DataSourceStatusManager {
    state: Mutex<DataSourceStatus>,
    broadcaster: Broadcaster<DataSourceStatus>,
}

impl DataSourceStatusManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DataSourceStatus::initial()),
            broadcaster: Broadcaster::new(),
        })
    }

    pub fn status(&self) -> DataSourceStatus {
        self.state.lock().expect("data-source status lock poisoned").clone()
    }

    pub fn subscribe(&self) -> Listener<DataSourceStatus> {
        self.broadcaster.add_listener()
    }

    /// Drives the state machine per the transition table and publishes the
    /// result if anything changed (state or last-known error).
    pub async fn update_status(&self, requested: DataSourceState, error_info: Option<ErrorInfo>) {
        let (status, changed) = {
            let mut guard = self.state.lock().expect("data-source status lock poisoned");
            let effective = coerce(guard.state, requested);
            let changed = effective != guard.state || error_info.is_some();
            guard.state = effective;
            if let Some(info) = error_info {
                guard.last_error = Some(info);
            }
            (guard.clone(), changed)
        };
        if changed {
            if status.state != DataSourceState::Initializing {
                info!(state = ?status.state, "data-source state transition");
            }
            self.broadcaster.broadcast(status).await;
        }
    }

    /// Blocks until the state machine enters `desired`, reaches the
    /// terminal `Off` state, or `timeout` elapses — returning whichever
    /// state was actually observed.
    pub async fn wait_for(&self, desired: DataSourceState, timeout: Duration) -> DataSourceState {
        let current = self.status().state;
        if current == desired || current == DataSourceState::Off {
            return current;
        }
        let mut listener = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.status().state;
            }
            match tokio::time::timeout(remaining, listener.recv()).await {
                Ok(Some(status)) if status.state == desired || status.state == DataSourceState::Off => {
                    return status.state;
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return self.status().state,
            }
        }
    }

    /// Transitions to `Off` and releases subscribers. Idempotent.
    pub async fn close(&self) {
        self.update_status(DataSourceState::Off, None).await;
        self.broadcaster.close();
    }
}
