//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent and may transiently disagree with each other.
//! This is acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use `get()`,
/// which clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize) as isize
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0) as usize
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Total bytes currently mapped by all pools in the process.
pub static TOTAL_MAPPED: Counter = Counter::new();

/// Number of live chunks across all pools in the process.
pub static CHUNKS_LIVE: Counter = Counter::new();
