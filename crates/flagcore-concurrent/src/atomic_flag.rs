use std::sync::atomic::{AtomicBool, Ordering};

/// A sticky boolean flag: once set to `true`, reads never observe `false`
/// again. Used for "initialized" and other one-way latches where a relaxed
/// atomic is enough and a mutex would be overkill.
#[derive(Debug, Default)]
pub struct AtomicFlag(AtomicBool);

impl AtomicFlag {
    pub const fn new(initial: bool) -> Self {
        Self(AtomicBool::new(initial))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sets the flag to `true`. No-op if already `true`.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Sets the flag to `value`, overwriting a previous `true` with `false`
    /// if asked. Most callers want `set`; this exists for flags that are
    /// not one-way latches (e.g. store availability).
    pub fn store(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }

    /// Atomically sets to `true` and reports whether this call was the one
    /// that flipped it (`false` -> `true`).
    pub fn set_if_unset(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
