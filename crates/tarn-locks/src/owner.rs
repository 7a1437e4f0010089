//! Shareable lock-owner identity.
//!
//! A [`crate::Locker`] is single-threaded, but two slivers of it must be
//! visible to other threads: the deadlock detector reads what a locker is
//! waiting for, and an interrupt can arrive from anywhere. Both live here,
//! behind an `Arc` that the shard tables also store as the holder identity.
//! A [`crate::PendingTxn`] carries its own handle, which is how exclusive
//! ownership outlives the locker that acquired it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use parking_lot::Mutex;

use crate::key::LockRef;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

struct Waiting {
    lock: LockRef,
    thread: Thread,
}

pub(crate) struct OwnerHandle {
    id: u64,
    waiting: Mutex<Option<Waiting>>,
    interrupted: AtomicBool,
}

impl OwnerHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
            waiting: Mutex::new(None),
            interrupted: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Publish the lock this owner is about to park on. Read by the
    /// deadlock detector from other threads.
    pub(crate) fn begin_wait(&self, lock: LockRef) {
        *self.waiting.lock() = Some(Waiting {
            lock,
            thread: thread::current(),
        });
    }

    /// Clear the published wait. Called on grant and after deadlock
    /// diagnosis; a timed-out wait leaves it set until the detector has run.
    pub(crate) fn end_wait(&self) {
        *self.waiting.lock() = None;
    }

    pub(crate) fn waiting_for(&self) -> Option<LockRef> {
        self.waiting.lock().as_ref().map(|w| w.lock.clone())
    }

    /// Set the interrupt flag and kick the parked thread, if any.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        if let Some(waiting) = self.waiting.lock().as_ref() {
            waiting.thread.unpark();
        }
    }

    /// Peek at the interrupt flag without consuming it.
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Consume the interrupt flag.
    pub(crate) fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for OwnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerHandle")
            .field("id", &self.id)
            .field("waiting", &self.waiting_for())
            .finish_non_exhaustive()
    }
}

/// Cloneable handle for interrupting a locker's in-progress wait from
/// another thread. The interrupted wait returns
/// [`crate::LockResult::Interrupted`].
#[derive(Clone)]
pub struct InterruptHandle {
    pub(crate) owner: Arc<OwnerHandle>,
}

impl InterruptHandle {
    /// Interrupt the owning locker's current or next wait.
    pub fn interrupt(&self) {
        self.owner.interrupt();
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("owner", &self.owner.id())
            .finish()
    }
}
