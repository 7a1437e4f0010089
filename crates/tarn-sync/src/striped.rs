//! Split counter with per-thread striping.
//!
//! A single shared `AtomicU64` becomes a coherence hot spot when many threads
//! increment it. [`StripedCounter`] spreads increments over a small array of
//! cache-line-padded cells, one picked per thread, and folds them on read.
//! Increments are cheap and uncontended; `sum` is a full sweep and is meant
//! for the rare observer (the commit gate's exclusive path).

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::cache_aligned::CacheAligned;

/// Monotonically assigned stripe slot for the calling thread.
fn thread_slot() -> usize {
    static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static SLOT: Cell<usize> = const { Cell::new(usize::MAX) };
    }

    SLOT.with(|slot| {
        let mut value = slot.get();
        if value == usize::MAX {
            value = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
            slot.set(value);
        }
        value
    })
}

fn stripe_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .next_power_of_two()
}

/// A monotonically increasing counter striped across cache lines.
pub struct StripedCounter {
    cells: Box<[CacheAligned<AtomicU64>]>,
    mask: usize,
}

impl StripedCounter {
    /// Create a counter with one stripe per hardware thread, rounded up to a
    /// power of two.
    #[must_use]
    pub fn new() -> Self {
        let stripes = stripe_count();
        let cells = (0..stripes)
            .map(|_| CacheAligned::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            cells,
            mask: stripes - 1,
        }
    }

    /// Add `n` to the calling thread's stripe.
    #[inline]
    pub fn add(&self, n: u64) {
        let cell = &self.cells[thread_slot() & self.mask];
        cell.fetch_add(n, Ordering::AcqRel);
    }

    /// Fold all stripes. Wrapping; callers compare sums rather than read
    /// absolute values.
    #[must_use]
    pub fn sum(&self) -> u64 {
        self.cells
            .iter()
            .map(|cell| cell.load(Ordering::Acquire))
            .fold(0_u64, u64::wrapping_add)
    }
}

impl Default for StripedCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StripedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedCounter")
            .field("stripes", &self.cells.len())
            .field("sum", &self.sum())
            .finish()
    }
}
