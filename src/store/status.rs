use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use flagcore_concurrent::Broadcaster;

/// Default recovery-poll interval (§4.4.5).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Status of the store's backing availability (§6 `StoreStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub available: bool,
    pub needs_refresh: bool,
}

impl StoreStatus {
    pub const fn initial() -> Self {
        Self {
            available: true,
            needs_refresh: false,
        }
    }
}

/// A single poll attempt's outcome: `None` means the backend is still
/// unreachable (or reachable but reseeding from cache failed — keep
/// polling either way); `Some(status)` means recovery completed and this
/// is the status to publish.
///
/// Folding the liveness probe and any write-behind reseed into one
/// closure (rather than having the manager know about caching modes)
/// keeps the manager ignorant of §4.4's caching policy, matching its role
/// in the component table as availability bookkeeping only.
pub type RecoveryProbe = Arc<dyn Fn() -> BoxFuture<'static, Option<StoreStatus>> + Send + Sync>;

/// Tracks store availability and runs a recovery poller across an outage,
/// publishing transitions via a [`Broadcaster`] (§4.5).
pub struct StoreStatusManager {
    state: Mutex<StoreStatus>,
    broadcaster: Broadcaster<StoreStatus>,
    poll_interval: Duration,
    poller: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StoreStatusManager {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StoreStatus::initial()),
            broadcaster: Broadcaster::new(),
            poll_interval,
            poller: tokio::sync::Mutex::new(None),
        })
    }

    pub fn with_default_interval() -> Arc<Self> {
        Self::new(DEFAULT_POLL_INTERVAL)
    }

    pub fn status(&self) -> StoreStatus {
        *self.state.lock().expect("store status lock poisoned")
    }

    pub fn subscribe(&self) -> flagcore_concurrent::Listener<StoreStatus> {
        self.broadcaster.add_listener()
    }

    /// Marks the store unavailable. If this is a transition from
    /// available, publishes the new status and starts a recovery poller
    /// that repeatedly calls `recover` until it reports recovery complete.
    /// Identical-state calls are dropped (§8 invariant 7).
    pub async fn mark_unavailable(self: &Arc<Self>, recover: RecoveryProbe) {
        let was_available = {
            let mut guard = self.state.lock().expect("store status lock poisoned");
            let was = guard.available;
            if was {
                *guard = StoreStatus {
                    available: false,
                    needs_refresh: false,
                };
            }
            was
        };
        if !was_available {
            return;
        }
        warn!("store marked unavailable; starting recovery poller");
        self.broadcaster.broadcast(self.status()).await;
        self.spawn_poller(recover).await;
    }

    async fn spawn_poller(self: &Arc<Self>, recover: RecoveryProbe) {
        let this = self.clone();
        let interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                debug!("polling for store recovery");
                match recover().await {
                    Some(status) => {
                        this.complete_recovery(status).await;
                        break;
                    }
                    None => continue,
                }
            }
        });
        // There is at most one poller at a time, since mark_unavailable
        // only spawns on a true->false transition; a stale handle here
        // would mean a bug upstream, so replacing it (and dropping/
        // cancelling the old one) is the right recovery.
        let mut guard = self.poller.lock().await;
        *guard = Some(handle);
    }

    async fn complete_recovery(self: &Arc<Self>, status: StoreStatus) {
        {
            let mut guard = self.state.lock().expect("store status lock poisoned");
            *guard = status;
        }
        info!(needs_refresh = status.needs_refresh, "store recovered");
        self.broadcaster.broadcast(status).await;
        let mut guard = self.poller.lock().await;
        *guard = None;
    }

    /// Directly publishes an availability transition without involving the
    /// poller — used by callers that already know they're available (e.g.
    /// a successful write right after startup) and by tests.
    pub async fn update_availability(self: &Arc<Self>, available: bool, needs_refresh: bool) {
        let changed = {
            let mut guard = self.state.lock().expect("store status lock poisoned");
            let changed = guard.available != available;
            *guard = StoreStatus {
                available,
                needs_refresh,
            };
            changed
        };
        if changed {
            self.broadcaster.broadcast(self.status()).await;
        }
    }

    /// Stops any running poller and releases subscribers. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.poller.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        self.broadcaster.close();
    }
}
