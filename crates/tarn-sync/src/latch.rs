//! Multi-mode latch with queued waiters.
//!
//! The latch is the engine's generic reader/writer gate: shared mode for
//! concurrent readers, exclusive mode for structural change, plus downgrade
//! and a single-reader upgrade. It is optimized for the uncontended path (one
//! CAS) and stays fair under contention through a denied-handoff protocol: a
//! releaser may let a new arrival barge ahead of the queue once, but a waiter
//! that loses that race flags itself and the next release must hand the latch
//! over directly.
//!
//! ## State word
//!
//! A single `AtomicU32`:
//!
//! - `0`: unheld.
//! - `1..=0x7fff_ffff`: held shared by N readers.
//! - `0x8000_0000`: held exclusively.
//! - high bit set with nonzero low bits: held shared *and* exclusive
//!   requested ("xshared"); new shared requests must queue.
//!
//! ## Wait queue
//!
//! A FIFO of reference-counted nodes behind a small mutex. Grants mark the
//! node and unpark its thread; timed-out waiters unlink themselves under the
//! same guard, so a concurrent grant and a cancellation cannot both win.
//! A timed-out exclusive request additionally clears an orphaned xshared
//! high bit, otherwise draining readers would promote the state to exclusive
//! with no owner.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Exclusive bit of the latch state word.
const EXCLUSIVE: u32 = 0x8000_0000;

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const CANCELLED: u8 = 2;

fn spin_limit() -> usize {
    static LIMIT: AtomicUsize = AtomicUsize::new(0);
    match LIMIT.load(Ordering::Relaxed) {
        0 => {
            let cores = thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1);
            LIMIT.store(cores, Ordering::Relaxed);
            cores
        }
        limit => limit,
    }
}

/// CAS retry pacing: spin up to the core count, then yield.
#[inline]
fn spin(trials: usize) -> usize {
    let trials = trials + 1;
    if trials >= spin_limit() {
        thread::yield_now();
        0
    } else {
        std::hint::spin_loop();
        trials
    }
}

struct WaitNode {
    thread: Thread,
    shared: bool,
    state: AtomicU8,
    /// Set by a waiter that lost a handoff race; forces the next releaser to
    /// hand off instead of barging.
    denied: AtomicBool,
}

impl WaitNode {
    fn new(shared: bool) -> Arc<Self> {
        Arc::new(Self {
            thread: thread::current(),
            shared,
            state: AtomicU8::new(WAITING),
            denied: AtomicBool::new(false),
        })
    }

    fn is_granted(&self) -> bool {
        self.state.load(Ordering::Acquire) == GRANTED
    }

    fn grant(&self) {
        self.state.store(GRANTED, Ordering::Release);
        self.thread.unpark();
    }
}

/// The raw multi-mode gate. See the module docs for the state protocol.
///
/// Most code consumes this through [`Latch`], which couples the gate to the
/// data it guards; the raw form exists for callers that gate a protocol
/// rather than a value (the commit gate, the remap serializer).
pub struct RawLatch {
    state: AtomicU32,
    queue: Mutex<VecDeque<Arc<WaitNode>>>,
}

impl RawLatch {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to acquire the exclusive latch, barging ahead of any waiters.
    #[inline]
    pub fn try_acquire_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire the exclusive latch, barging ahead of any waiters if possible.
    pub fn acquire_exclusive(&self) {
        let mut trials = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state == 0 {
                if self
                    .state
                    .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if state & EXCLUSIVE == 0 {
                // Shared holders prevent an immediate grab, but setting the
                // high bit stops new readers from being granted.
                if self
                    .state
                    .compare_exchange(state, state | EXCLUSIVE, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    self.wait_exclusive(None);
                    return;
                }
            } else {
                self.wait_exclusive(None);
                return;
            }
            trials = spin(trials);
        }
    }

    /// Timed [`RawLatch::acquire_exclusive`]. Returns false on expiry.
    pub fn try_acquire_exclusive_for(&self, timeout: Duration) -> bool {
        self.try_acquire_exclusive_until(Instant::now() + timeout)
    }

    /// Deadline variant of [`RawLatch::try_acquire_exclusive_for`].
    pub fn try_acquire_exclusive_until(&self, deadline: Instant) -> bool {
        let mut trials = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state == 0 {
                if self
                    .state
                    .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
            } else {
                if Instant::now() >= deadline {
                    return false;
                }
                if state & EXCLUSIVE == 0
                    && self
                        .state
                        .compare_exchange(
                            state,
                            state | EXCLUSIVE,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_err()
                {
                    trials = spin(trials);
                    continue;
                }
                return self.wait_exclusive(Some(deadline));
            }
            trials = spin(trials);
        }
    }

    /// Try to acquire the shared latch, barging ahead of any waiters.
    #[inline]
    pub fn try_acquire_shared(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        state & EXCLUSIVE == 0
            && self
                .state
                .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Acquire the shared latch, barging ahead of any waiters if possible.
    pub fn acquire_shared(&self) {
        let mut trials = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & EXCLUSIVE != 0 {
                self.wait_shared(None);
                return;
            }
            if self
                .state
                .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            trials = spin(trials);
        }
    }

    /// Timed [`RawLatch::acquire_shared`]. Returns false on expiry.
    pub fn try_acquire_shared_for(&self, timeout: Duration) -> bool {
        self.try_acquire_shared_until(Instant::now() + timeout)
    }

    /// Deadline variant of [`RawLatch::try_acquire_shared_for`].
    pub fn try_acquire_shared_until(&self, deadline: Instant) -> bool {
        let mut trials = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & EXCLUSIVE != 0 {
                if Instant::now() >= deadline {
                    return false;
                }
                return self.wait_shared(Some(deadline));
            }
            if self
                .state
                .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            trials = spin(trials);
        }
    }

    /// Upgrade a held shared latch to exclusive. Fails unless the caller is
    /// the only reader.
    pub fn try_upgrade(&self) -> bool {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & !EXCLUSIVE != 1 {
                return false;
            }
            if self
                .state
                .compare_exchange(state, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            // Retry: the high bit usually flips on, not off.
        }
    }

    /// Downgrade the held exclusive latch to shared. The caller must later
    /// call [`RawLatch::release_shared`] instead of `release_exclusive`.
    pub fn downgrade(&self) {
        let mut queue = self.queue.lock();
        self.grant_shared_prefix(&mut queue, 1);
    }

    /// Release the held exclusive latch.
    pub fn release_exclusive(&self) {
        let mut queue = self.queue.lock();
        let Some(head) = queue.front() else {
            self.state.store(0, Ordering::Release);
            return;
        };
        if head.shared {
            // Combined downgrade and release: the contiguous run of shared
            // waiters at the head takes over.
            self.grant_shared_prefix(&mut queue, 0);
        } else if head.denied.load(Ordering::Relaxed) {
            // Fair handoff: ownership transfers directly, no race.
            let node = queue.pop_front().expect("head probed above");
            drop(queue);
            node.grant();
        } else {
            // Open the latch and let the head waiter race new arrivals.
            let node = Arc::clone(head);
            self.state.store(0, Ordering::Release);
            drop(queue);
            node.thread.unpark();
        }
    }

    /// Release a held shared latch.
    pub fn release_shared(&self) {
        let mut trials = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            debug_assert_ne!(state & !EXCLUSIVE, 0, "release_shared without a shared hold");
            if state & EXCLUSIVE != 0 {
                // An exclusive request is waiting for readers to drain.
                if self
                    .state
                    .compare_exchange(state, state - 1, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    if state - 1 == EXCLUSIVE {
                        // This thread released the last shared hold and now
                        // owns the exclusive slot; pass it down the queue.
                        self.release_exclusive();
                    }
                    return;
                }
            } else if self
                .state
                .compare_exchange(state, state - 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                if state - 1 == 0 && !self.queue.lock().is_empty() {
                    // A waiter raced in without managing to set the high bit.
                    // Reclaim and hand off so it is not stranded.
                    if self
                        .state
                        .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        self.release_exclusive();
                    }
                }
                return;
            }
            trials = spin(trials);
        }
    }

    /// True if any thread is parked on this latch.
    #[must_use]
    pub fn has_queued_waiters(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Grant the contiguous run of shared waiters at the queue head, leaving
    /// `base` shared holds for the caller. Re-arms the high bit if an
    /// exclusive waiter remains behind the run.
    fn grant_shared_prefix(&self, queue: &mut VecDeque<Arc<WaitNode>>, base: u32) {
        let mut granted = Vec::new();
        while let Some(head) = queue.front() {
            if !head.shared {
                break;
            }
            granted.push(queue.pop_front().expect("head probed above"));
        }
        let mut state = base + granted.len() as u32;
        if !queue.is_empty() {
            state |= EXCLUSIVE;
        }
        self.state.store(state, Ordering::Release);
        for node in granted {
            node.grant();
        }
    }

    /// Claim exclusive ownership, or at least deny new shared latches.
    /// Returns true only when ownership was taken.
    fn claim_exclusive(&self) -> bool {
        let mut trials = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state == 0 {
                if self
                    .state
                    .compare_exchange(0, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
            } else if state & EXCLUSIVE != 0 {
                return false;
            } else if self
                .state
                .compare_exchange(state, state | EXCLUSIVE, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return false;
            }
            trials = spin(trials);
        }
    }

    fn claim_shared(&self) -> bool {
        let mut trials = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & EXCLUSIVE != 0 {
                return false;
            }
            if self
                .state
                .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            trials = spin(trials);
        }
    }

    /// Unlink a node that acquired on its own. Returns false when the node
    /// was no longer queued, which under the queue guard means a concurrent
    /// grant already acquired on its behalf.
    fn remove_node(&self, node: &Arc<WaitNode>) -> bool {
        let mut queue = self.queue.lock();
        if let Some(pos) = queue.iter().position(|n| Arc::ptr_eq(n, node)) {
            queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Park until granted or claimed. Returns false only on deadline expiry.
    fn wait_exclusive(&self, deadline: Option<Instant>) -> bool {
        let node = WaitNode::new(false);
        self.queue.lock().push_back(Arc::clone(&node));

        // A release may have slipped in between the failed fast path and the
        // enqueue; retry once before the first park.
        if self.claim_exclusive() {
            self.remove_node(&node);
            return true;
        }

        loop {
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.cancel_exclusive(&node);
                    }
                    thread::park_timeout(deadline - now);
                }
            }

            if node.is_granted() {
                return true;
            }
            if self.claim_exclusive() {
                self.remove_node(&node);
                return true;
            }
            // Lost the race to a barger; demand a fair handoff next time.
            node.denied.store(true, Ordering::Relaxed);
        }
    }

    fn wait_shared(&self, deadline: Option<Instant>) -> bool {
        let node = WaitNode::new(true);
        self.queue.lock().push_back(Arc::clone(&node));

        if self.claim_shared_queued(&node) {
            return true;
        }

        loop {
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.cancel_shared(&node);
                    }
                    thread::park_timeout(deadline - now);
                }
            }

            if node.is_granted() {
                return true;
            }
            if self.claim_shared_queued(&node) {
                return true;
            }
            node.denied.store(true, Ordering::Relaxed);
        }
    }

    /// Claim a shared hold for a queued node. A sweep may have granted the
    /// node concurrently with the claim; the hold it counted for us is then
    /// surplus and is released again.
    fn claim_shared_queued(&self, node: &Arc<WaitNode>) -> bool {
        if !self.claim_shared() {
            return false;
        }
        if !self.remove_node(node) {
            self.release_shared();
        }
        true
    }

    /// Abort an exclusive wait. A grant that already happened wins over the
    /// cancellation; otherwise the node is unlinked and, if no exclusive
    /// waiter remains, an orphaned xshared high bit is cleared so the state
    /// cannot become exclusive without an owner.
    fn cancel_exclusive(&self, node: &Arc<WaitNode>) -> bool {
        let mut queue = self.queue.lock();
        if node.is_granted() {
            return true;
        }
        if let Some(pos) = queue.iter().position(|n| Arc::ptr_eq(n, node)) {
            queue.remove(pos);
        }
        node.state.store(CANCELLED, Ordering::Release);
        if !queue.iter().any(|n| !n.shared) {
            // Still under the queue guard: a concurrent exclusive enqueue
            // re-checks the state after queuing, so it cannot lose a bit
            // cleared here.
            let mut trials = 0;
            loop {
                let state = self.state.load(Ordering::Relaxed);
                if state & EXCLUSIVE == 0 || state == EXCLUSIVE {
                    break;
                }
                if self
                    .state
                    .compare_exchange(state, state & !EXCLUSIVE, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
                trials = spin(trials);
            }
        }
        false
    }

    fn cancel_shared(&self, node: &Arc<WaitNode>) -> bool {
        let mut queue = self.queue.lock();
        if node.is_granted() {
            return true;
        }
        if let Some(pos) = queue.iter().position(|n| Arc::ptr_eq(n, node)) {
            queue.remove(pos);
        }
        node.state.store(CANCELLED, Ordering::Release);
        false
    }
}

impl Default for RawLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RawLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        let mut s = f.debug_struct("RawLatch");
        if state == 0 {
            s.field("state", &"unheld");
        } else if state == EXCLUSIVE {
            s.field("state", &"exclusive");
        } else if state & EXCLUSIVE == 0 {
            s.field("shared", &state);
        } else {
            s.field("xshared", &(state & !EXCLUSIVE));
        }
        s.finish_non_exhaustive()
    }
}

// The latch plugs into the standard guard machinery so data-bearing users
// (lock shards, mapping tables) get scoped RAII access.

unsafe impl lock_api::RawRwLock for RawLatch {
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock_shared(&self) {
        self.acquire_shared();
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.try_acquire_shared()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        self.release_shared();
    }

    #[inline]
    fn lock_exclusive(&self) {
        self.acquire_exclusive();
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        self.try_acquire_exclusive()
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        self.release_exclusive();
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    #[inline]
    fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) == EXCLUSIVE
    }
}

unsafe impl lock_api::RawRwLockDowngrade for RawLatch {
    #[inline]
    unsafe fn downgrade(&self) {
        RawLatch::downgrade(self);
    }
}

unsafe impl lock_api::RawRwLockTimed for RawLatch {
    type Duration = Duration;
    type Instant = Instant;

    #[inline]
    fn try_lock_shared_for(&self, timeout: Duration) -> bool {
        self.try_acquire_shared_for(timeout)
    }

    #[inline]
    fn try_lock_shared_until(&self, deadline: Instant) -> bool {
        self.try_acquire_shared_until(deadline)
    }

    #[inline]
    fn try_lock_exclusive_for(&self, timeout: Duration) -> bool {
        self.try_acquire_exclusive_for(timeout)
    }

    #[inline]
    fn try_lock_exclusive_until(&self, deadline: Instant) -> bool {
        self.try_acquire_exclusive_until(deadline)
    }
}

/// A value guarded by a [`RawLatch`].
pub type Latch<T> = lock_api::RwLock<RawLatch, T>;

/// Shared guard for a [`Latch`].
pub type LatchReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawLatch, T>;

/// Exclusive guard for a [`Latch`].
pub type LatchWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawLatch, T>;
