//! In-process data plane for a server-side feature-flag SDK.
//!
//! This crate owns the versioned record store, the caching wrapper over a
//! persistent backend, the flag/segment change feed, and the data-source
//! state machine. It does not implement a persistent backend, an upstream
//! transport, or flag evaluation itself — those are external collaborators
//! this crate is built to be driven by and read from (see
//! [`data_source::DataSource`], [`store::PersistentStoreCore`], and
//! [`evaluator_adapter::FlagReader`]/[`evaluator_adapter::SegmentReader`]).
//!
//! Component map:
//! - [`model`] — the versioned record types (`Kind`, `ItemDescriptor`,
//!   `SerializedItemDescriptor`, `DataKind`).
//! - [`store`] — the in-memory authority, the persistent-backend
//!   contract, the caching wrapper, and store-availability tracking.
//! - [`dependency_order`] — batch reordering so prerequisites land before
//!   their dependents.
//! - [`data_source`] — the upstream contract plus the updater/state
//!   machine that turns its writes into store calls and change events.
//! - [`flag_tracker`] — the flag/segment change feed and derived
//!   value-change subscriptions.
//! - [`status_providers`] — narrow read-only status façades for callers
//!   that only need one concern.
//! - [`evaluator_adapter`] — the typed, tombstone-filtering read surface
//!   an evaluator consumes.
//! - [`error`] — the crate-wide error taxonomy.

pub mod data_source;
pub mod dependency_order;
pub mod error;
pub mod evaluator_adapter;
pub mod flag_tracker;
pub mod model;
pub mod status_providers;
pub mod store;

pub use data_source::{DataSource, DataSourceState, DataSourceStatus, DataSourceUpdater, ReadySignal};
pub use dependency_order::order_collections;
pub use error::{ModelError, SourceErrorKind, StoreError};
pub use evaluator_adapter::{EvaluatorReadAdapter, FlagReader, SegmentReader};
pub use flag_tracker::{FlagChangeEvent, FlagTracker, FlagValueChangeEvent};
pub use model::{
    data_kind_for, Collection, DataKind, FlagPayload, ItemDescriptor, Kind, OpaquePayload, Payload,
    SegmentPayload, SerializedItemDescriptor,
};
pub use status_providers::{DataSourceStatusProvider, DataStoreStatusProvider, UpstreamSegmentsStatusProvider};
pub use store::{CacheTtl, DataStore, InMemoryStore, PersistentStoreCore, PersistentStoreWrapper, StoreStatus, StoreStatusManager, WrapperConfig};
