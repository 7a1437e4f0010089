//! Detached exclusive-lock holder for asynchronous commit.
//!
//! A committing transaction that has already made itself durable can hand
//! its exclusive locks to a [`PendingTxn`] and discard its [`crate::Locker`]
//! immediately; the pending object keeps the keys fenced until whatever
//! finishes the commit releases it. Ownership in the shard tables is
//! reassigned to the pending object's own identity, so the original locker
//! is free to be dropped or reused.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::key::LockRef;
use crate::manager::LockManager;
use crate::owner::OwnerHandle;

/// Exclusive locks detached from a closing locker, scheduled to be released
/// later. Dropping the object releases them.
pub struct PendingTxn {
    manager: Arc<LockManager>,
    owner: Arc<OwnerHandle>,
    locks: Vec<LockRef>,
}

impl PendingTxn {
    pub(crate) fn new(
        manager: Arc<LockManager>,
        owner: Arc<OwnerHandle>,
        locks: Vec<LockRef>,
    ) -> Self {
        Self {
            manager,
            owner,
            locks,
        }
    }

    /// Number of transferred exclusive locks still held.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Release every transferred lock now.
    pub fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        trace!(count = self.locks.len(), "releasing pending transaction locks");
        // Newest first, mirroring a locker unwinding its stack.
        while let Some(lock) = self.locks.pop() {
            if let Err(error) = self.manager.unlock(&self.owner, &lock) {
                warn!(%error, "pending lock release failed");
            }
        }
    }
}

impl Drop for PendingTxn {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for PendingTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTxn")
            .field("owner", &self.owner.id())
            .field("locks", &self.locks.len())
            .finish()
    }
}
