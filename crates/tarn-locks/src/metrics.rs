//! Global lock manager counters (lock-free, Relaxed ordering).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static TARN_LOCKS_ACQUIRED_TOTAL: AtomicU64 = AtomicU64::new(0);
static TARN_LOCK_WAITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static TARN_LOCK_TIMEOUTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static TARN_DEADLOCKS_DETECTED_TOTAL: AtomicU64 = AtomicU64::new(0);

pub(crate) fn count_acquired() {
    TARN_LOCKS_ACQUIRED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_wait() {
    TARN_LOCK_WAITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_timeout() {
    TARN_LOCK_TIMEOUTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_deadlock() {
    TARN_DEADLOCKS_DETECTED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of lock manager metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockMetrics {
    pub tarn_locks_acquired_total: u64,
    pub tarn_lock_waits_total: u64,
    pub tarn_lock_timeouts_total: u64,
    pub tarn_deadlocks_detected_total: u64,
}

/// Read current lock metrics.
#[must_use]
pub fn lock_metrics() -> LockMetrics {
    LockMetrics {
        tarn_locks_acquired_total: TARN_LOCKS_ACQUIRED_TOTAL.load(Ordering::Relaxed),
        tarn_lock_waits_total: TARN_LOCK_WAITS_TOTAL.load(Ordering::Relaxed),
        tarn_lock_timeouts_total: TARN_LOCK_TIMEOUTS_TOTAL.load(Ordering::Relaxed),
        tarn_deadlocks_detected_total: TARN_DEADLOCKS_DETECTED_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset metrics (for tests).
pub fn reset_lock_metrics() {
    TARN_LOCKS_ACQUIRED_TOTAL.store(0, Ordering::Relaxed);
    TARN_LOCK_WAITS_TOTAL.store(0, Ordering::Relaxed);
    TARN_LOCK_TIMEOUTS_TOTAL.store(0, Ordering::Relaxed);
    TARN_DEADLOCKS_DETECTED_TOTAL.store(0, Ordering::Relaxed);
}
