//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent and cross-counter snapshots may be transiently
//! inconsistent. This is acceptable for diagnostic display. Do NOT use these
//! values for allocation decisions.

use crate::sync::atomic::{AtomicUsize, Ordering};

/// Diagnostic-only gauge counter.
pub struct Counter(AtomicUsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(val, Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

// Bytes of region space currently mapped by live allocators.
crate::sync::static_atomic! {
    pub static REGION_MAPPED: Counter = Counter::new();
}

// Segments carved out of regions since process start.
crate::sync::static_atomic! {
    pub static SEGMENTS_CARVED: Counter = Counter::new();
}

// Free entries moved from thread caches into shared pools by rebalancing.
crate::sync::static_atomic! {
    pub static ENTRIES_REBALANCED: Counter = Counter::new();
}
