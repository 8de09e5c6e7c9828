//! The external data-source contract (§6) and the updater/state machine
//! that consumes it (§4.7).

mod state;
mod updater;

pub use state::{
    requested_state_for_error, DataSourceState, DataSourceStatus, DataSourceStatusManager, ErrorInfo,
};
pub use updater::DataSourceUpdater;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

/// Fired exactly once by a [`DataSource`] implementation, as soon as it
/// has either completed its first full initialization or determined it
/// can never succeed (§6).
pub struct ReadySignal(oneshot::Sender<()>);

impl ReadySignal {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Consumes the signal, firing it. Takes `self` by value since the
    /// underlying sender can only be used once.
    pub fn fire(self) {
        let _ = self.0.send(());
    }
}

/// The external collaborator this crate depends on but does not
/// implement (§6): a task that establishes an upstream connection and
/// reports progress to a [`DataSourceUpdater`]. Hand-rolled boxed futures
/// rather than `async-trait`, matching this crate's other object-safe
/// traits (`DataStore`, `PersistentStoreCore`).
pub trait DataSource: Send + Sync {
    fn start(&self, ready: ReadySignal) -> BoxFuture<'_, ()>;

    fn close(&self) -> BoxFuture<'_, ()>;
}
