//! Small, narrow concurrency primitives shared by the data-plane core.
//!
//! Kept as a satellite crate so the primitives stay reusable and
//! independently testable, the way the main crate's domain logic pulls in
//! a handful of focused utility crates rather than growing a `util` module
//! with no boundary.

mod atomic_flag;
mod broadcaster;
mod singleflight;

pub use atomic_flag::AtomicFlag;
pub use broadcaster::{Broadcaster, Listener};
pub use singleflight::SingleFlight;
