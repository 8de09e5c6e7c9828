//! The read-only surface an external evaluator consumes (§4.9, §6): two
//! capability traits backed by the store, with tombstones and backend
//! errors both collapsing to "nil" — evaluation is not in a position to
//! do anything with either distinction, only the data-plane's own
//! status surface is.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::warn;

use crate::model::{FlagPayload, Kind, Payload, SegmentPayload};
use crate::store::DataStore;

/// What an evaluator needs to resolve a flag's prerequisites and rules.
pub trait FlagReader: Send + Sync {
    fn get_flag<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<FlagPayload>>;
}

/// What an evaluator needs to resolve a segment-membership rule.
pub trait SegmentReader: Send + Sync {
    fn get_segment<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<SegmentPayload>>;
}

/// Adapts a [`DataStore`] to the narrow, typed surface an evaluator
/// expects, so the evaluator never has to know about versions,
/// tombstones, or store errors.
pub struct EvaluatorReadAdapter {
    store: Arc<dyn DataStore>,
}

impl EvaluatorReadAdapter {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

impl FlagReader for EvaluatorReadAdapter {
    fn get_flag<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<FlagPayload>> {
        async move {
            let item = match self.store.get(Kind::FLAGS, key).await {
                Ok(item) => item,
                Err(e) => {
                    warn!(key, error = %e, "store error resolving flag for evaluator");
                    return None;
                }
            };
            match item.item {
                Some(Payload::Flag(flag)) => Some(flag),
                Some(other) => {
                    warn!(key, kind = other.key(), "flag kind key held a non-flag payload");
                    None
                }
                None => None,
            }
        }
        .boxed()
    }
}

impl SegmentReader for EvaluatorReadAdapter {
    fn get_segment<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<SegmentPayload>> {
        async move {
            let item = match self.store.get(Kind::SEGMENTS, key).await {
                Ok(item) => item,
                Err(e) => {
                    warn!(key, error = %e, "store error resolving segment for evaluator");
                    return None;
                }
            };
            match item.item {
                Some(Payload::Segment(segment)) => Some(segment),
                Some(_) => {
                    warn!(key, "segment kind key held a non-segment payload");
                    None
                }
                None => None,
            }
        }
        .boxed()
    }
}
