//! Reader-majority commit gate.
//!
//! Every write transaction holds the gate shared for the duration of a
//! storage mutation; the checkpointer takes it exclusively to observe a
//! quiescent engine. Shared traffic is constant and must stay cheap, so the
//! gate counts acquires and releases in two [`StripedCounter`]s instead of a
//! single contended word, and the exclusive path pays the cost of sweeping
//! both.
//!
//! Shared acquisition is reentrant per thread; exclusive is not.
//!
//! ## Liveness
//!
//! The shared fast path checks the exclusive-pending flag *before*
//! incrementing its counter, so once an exclusive request publishes itself a
//! continuous stream of readers cannot keep `has_shared_lockers` true
//! forever. In the other direction, the exclusive path waits with
//! exponentially growing park bounds and withdraws its pending flag between
//! retries, de-prioritizing itself instead of stalling readers behind the
//! inner latch indefinitely.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::latch::RawLatch;
use crate::striped::StripedCounter;

thread_local! {
    /// Per-thread shared reentrancy counts, keyed by gate id.
    static REENTRANCY: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

/// Coordination gate between bulk checkpoint work and all other writers.
pub struct CommitLatch {
    shared_acquire: StripedCounter,
    shared_release: StripedCounter,
    inner: RawLatch,
    exclusive_pending: AtomicBool,
    exclusive_waiter: Mutex<Option<Thread>>,
    id: u64,
}

impl CommitLatch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared_acquire: StripedCounter::new(),
            shared_release: StripedCounter::new(),
            inner: RawLatch::new(),
            exclusive_pending: AtomicBool::new(false),
            exclusive_waiter: Mutex::new(None),
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn reentrancy(&self) -> usize {
        REENTRANCY.with(|counts| counts.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn adjust_reentrancy(&self, delta: isize) {
        REENTRANCY.with(|counts| {
            let mut counts = counts.borrow_mut();
            let entry = counts.entry(self.id).or_insert(0);
            if delta >= 0 {
                *entry += delta as usize;
            } else {
                debug_assert!(*entry > 0, "unbalanced commit gate release");
                *entry = entry.saturating_sub((-delta) as usize);
                if *entry == 0 {
                    counts.remove(&self.id);
                }
            }
        });
    }

    /// Acquire the gate shared. Reentrant; never blocks a thread that
    /// already holds it.
    pub fn acquire_shared(&self) {
        if self.exclusive_pending.load(Ordering::Acquire) && self.reentrancy() == 0 {
            self.inner.acquire_shared();
            self.shared_acquire.add(1);
            self.inner.release_shared();
        } else {
            self.shared_acquire.add(1);
        }
        self.adjust_reentrancy(1);
    }

    /// Fast-path-only shared acquire; fails instead of queuing behind a
    /// pending exclusive request.
    pub fn try_acquire_shared(&self) -> bool {
        if self.exclusive_pending.load(Ordering::Acquire) && self.reentrancy() == 0 {
            return false;
        }
        self.shared_acquire.add(1);
        self.adjust_reentrancy(1);
        true
    }

    /// Timed shared acquire. Returns false on expiry.
    pub fn acquire_shared_timed(&self, timeout: Duration) -> bool {
        if self.exclusive_pending.load(Ordering::Acquire) && self.reentrancy() == 0 {
            if !self.inner.try_acquire_shared_for(timeout) {
                return false;
            }
            self.shared_acquire.add(1);
            self.inner.release_shared();
        } else {
            self.shared_acquire.add(1);
        }
        self.adjust_reentrancy(1);
        true
    }

    /// Release a shared hold, waking the exclusive waiter when this was the
    /// last one out.
    pub fn release_shared(&self) {
        self.shared_release.add(1);
        if self.exclusive_pending.load(Ordering::Acquire) && !self.has_shared_lockers() {
            if let Some(waiter) = self.exclusive_waiter.lock().clone() {
                waiter.unpark();
            }
        }
        self.adjust_reentrancy(-1);
    }

    /// Acquire the gate exclusively, waiting out all shared holders.
    ///
    /// Only one thread at a time gets past the inner latch; the rest of the
    /// work is draining readers that acquired before the pending flag was
    /// published.
    pub fn acquire_exclusive(&self) {
        self.inner.acquire_exclusive();

        let mut bound = Duration::from_micros(1);
        while !self.finish_acquire_exclusive(bound) {
            bound = bound.saturating_mul(2);
            debug!(gate = self.id, ?bound, "commit gate retrying exclusive drain");
        }
        self.adjust_reentrancy(1);
    }

    /// One bounded drain attempt. On expiry the pending flag is withdrawn so
    /// queued readers can flow before the retry.
    fn finish_acquire_exclusive(&self, bound: Duration) -> bool {
        *self.exclusive_waiter.lock() = Some(thread::current());
        self.exclusive_pending.store(true, Ordering::Release);

        if self.has_shared_lockers() {
            let deadline = Instant::now() + bound;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    self.exclusive_pending.store(false, Ordering::Release);
                    *self.exclusive_waiter.lock() = None;
                    return false;
                }
                thread::park_timeout(deadline - now);
                if !self.has_shared_lockers() {
                    break;
                }
            }
        }
        true
    }

    /// Release the exclusive hold.
    pub fn release_exclusive(&self) {
        self.exclusive_pending.store(false, Ordering::Release);
        *self.exclusive_waiter.lock() = None;
        self.inner.release_exclusive();
        self.adjust_reentrancy(-1);
    }

    /// True while any shared acquisition has not been released.
    ///
    /// Reads the release sum first; the reversed order could observe an
    /// acquire without its release and report quiescence too early.
    #[must_use]
    pub fn has_shared_lockers(&self) -> bool {
        self.shared_release.sum() != self.shared_acquire.sum()
    }

    /// Shared acquisitions so far (for balance assertions in tests).
    #[must_use]
    pub fn acquire_sum(&self) -> u64 {
        self.shared_acquire.sum()
    }

    /// Shared releases so far.
    #[must_use]
    pub fn release_sum(&self) -> u64 {
        self.shared_release.sum()
    }

    /// True if any thread is queued on the inner latch.
    #[must_use]
    pub fn has_queued_waiters(&self) -> bool {
        self.inner.has_queued_waiters()
    }
}

impl Default for CommitLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommitLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLatch")
            .field("id", &self.id)
            .field("acquired", &self.shared_acquire.sum())
            .field("released", &self.shared_release.sum())
            .field("exclusive_pending", &self.exclusive_pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn shared_is_reentrant() {
        let gate = CommitLatch::new();
        gate.acquire_shared();
        gate.acquire_shared();
        assert!(gate.has_shared_lockers());
        gate.release_shared();
        gate.release_shared();
        assert!(!gate.has_shared_lockers());
    }

    #[test]
    fn exclusive_waits_for_readers() {
        let gate = Arc::new(CommitLatch::new());
        gate.acquire_shared();

        let exclusive = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.acquire_exclusive();
                let quiescent = !gate.has_shared_lockers();
                gate.release_exclusive();
                quiescent
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(gate.has_shared_lockers());
        gate.release_shared();
        assert!(exclusive.join().unwrap());
    }

    #[test]
    fn try_shared_fails_while_exclusive_pending() {
        let gate = Arc::new(CommitLatch::new());
        gate.acquire_exclusive();

        let reader = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.try_acquire_shared())
        };
        assert!(!reader.join().unwrap());
        gate.release_exclusive();
        assert!(gate.try_acquire_shared());
        gate.release_shared();
    }

    #[test]
    fn reentrant_reader_passes_pending_exclusive() {
        let gate = Arc::new(CommitLatch::new());
        gate.acquire_shared();

        let exclusive = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.acquire_exclusive();
                gate.release_exclusive();
            })
        };

        // Let the exclusive request publish itself, then reenter. The
        // reentrant acquire must not deadlock against our own hold.
        thread::sleep(Duration::from_millis(20));
        gate.acquire_shared();
        gate.release_shared();
        gate.release_shared();
        exclusive.join().unwrap();
        assert_eq!(gate.acquire_sum(), gate.release_sum());
    }
}
