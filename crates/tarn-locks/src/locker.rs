//! Per-transaction lock ownership with scoped release.
//!
//! A [`Locker`] accumulates the locks a transaction holds on a stack and
//! releases them in reverse order at commit, rollback, or scope exit. It is
//! **not** thread-safe: at most one thread may operate on it at a time,
//! though it may be handed between threads if the caller establishes a
//! happens-before edge. The shareable sliver of its identity (what it waits
//! on, its interrupt flag) lives in [`crate::owner::OwnerHandle`].
//!
//! ## Stack layout
//!
//! The common small transaction holds one lock, stored inline with no
//! allocation. Beyond that, locks go into chained blocks of 8 to 64 slots.
//! Each block carries a 64-bit bitmap marking entries that were promotions
//! of a lock already held: on release those entries demote back to
//! upgradable instead of unlocking outright, which is what makes a scope
//! exit restore exactly the lock set of the matching scope entry.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::deadlock;
use crate::error::LockError;
use crate::key::LockRef;
use crate::manager::{LockManager, LockMode, PushOp};
use crate::metrics;
use crate::owner::{InterruptHandle, OwnerHandle};
use crate::pending::PendingTxn;
use crate::result::LockResult;

const FIRST_BLOCK_CAPACITY: usize = 8;
/// Limited by the bits in the upgrade bitmap.
const HIGHEST_BLOCK_CAPACITY: usize = 64;

struct Block {
    locks: Vec<LockRef>,
    cap: usize,
    upgrades: u64,
    prev: Option<Box<Block>>,
}

impl Block {
    fn first(lock: LockRef, upgrade: bool) -> Box<Block> {
        let mut locks = Vec::with_capacity(FIRST_BLOCK_CAPACITY);
        locks.push(lock);
        Box::new(Block {
            locks,
            cap: FIRST_BLOCK_CAPACITY,
            upgrades: u64::from(upgrade),
            prev: None,
        })
    }

    fn pair(first: LockRef, second: LockRef, upgrade: bool) -> Box<Block> {
        let mut locks = Vec::with_capacity(FIRST_BLOCK_CAPACITY);
        locks.push(first);
        locks.push(second);
        Box::new(Block {
            locks,
            cap: FIRST_BLOCK_CAPACITY,
            upgrades: u64::from(upgrade) << 1,
            prev: None,
        })
    }

    fn grow(prev: Box<Block>, lock: LockRef, upgrade: bool) -> Box<Block> {
        let cap = (prev.cap * 2).min(HIGHEST_BLOCK_CAPACITY);
        let mut locks = Vec::with_capacity(cap);
        locks.push(lock);
        Box::new(Block {
            locks,
            cap,
            upgrades: u64::from(upgrade),
            prev: Some(prev),
        })
    }

    fn is_full(&self) -> bool {
        self.locks.len() == self.cap
    }

    fn push(&mut self, lock: LockRef, upgrade: bool) {
        debug_assert!(!self.is_full());
        let idx = self.locks.len();
        self.locks.push(lock);
        if upgrade {
            self.upgrades |= 1_u64 << idx;
        }
    }

    fn pop(&mut self) -> Option<LockRef> {
        let lock = self.locks.pop()?;
        self.upgrades &= !(1_u64 << self.locks.len());
        Some(lock)
    }

    fn last(&self) -> &LockRef {
        self.locks.last().expect("blocks are never empty at rest")
    }

    fn upgrade_bit(&self, idx: usize) -> bool {
        self.upgrades >> idx & 1 != 0
    }

    fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut block = self;
        while let Some(prev) = &block.prev {
            len += 1;
            block = prev;
        }
        len
    }
}

enum Tail {
    Empty,
    /// First acquisition, stored inline to avoid allocation.
    One(LockRef),
    Blocks(Box<Block>),
}

/// Shape of the stack, snapshotted at scope entry. Entries below a live
/// scope boundary can never be popped, so matching shapes imply a matching
/// stack prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailShape {
    Empty,
    One,
    Blocks { chain: usize, top_len: usize },
}

struct ParentScope {
    parent: Option<Box<ParentScope>>,
    snapshot: TailShape,
    saved_timeout: Option<Duration>,
}

/// The lock-holding identity of one transaction.
pub struct Locker {
    manager: Arc<LockManager>,
    owner: Arc<OwnerHandle>,
    tail: Tail,
    parent: Option<Box<ParentScope>>,
    timeout: Option<Duration>,
}

impl Locker {
    #[must_use]
    pub fn new(manager: Arc<LockManager>) -> Self {
        let timeout = manager.default_timeout();
        Self {
            manager,
            owner: OwnerHandle::new(),
            tail: Tail::Empty,
            parent: None,
            timeout,
        }
    }

    /// Stable id of this locker, as reported in deadlock sets.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.owner.id()
    }

    /// Wait bound applied when the caller passes no explicit timeout.
    /// Saved and restored across scopes.
    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_lock_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Handle for interrupting this locker's waits from another thread.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            owner: Arc::clone(&self.owner),
        }
    }

    pub(crate) fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    pub(crate) fn owner_handle(&self) -> &Arc<OwnerHandle> {
        &self.owner
    }

    // -- acquisition ------------------------------------------------------

    /// Acquire a shared lock, denying exclusive locks. An `already_owned`
    /// result means no extra unlock is owed.
    pub fn lock_shared(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.lock(LockMode::Shared, index_id, key, timeout)
    }

    /// Acquire an upgradable lock, denying exclusive and other upgradable
    /// locks but admitting shared ones.
    pub fn lock_upgradable(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.lock(LockMode::Upgradable, index_id, key, timeout)
    }

    /// Acquire an exclusive lock, denying all others.
    pub fn lock_exclusive(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.lock(LockMode::Exclusive, index_id, key, timeout)
    }

    /// Non-throwing [`Locker::lock_shared`]: timeouts come back as
    /// [`LockResult::TimedOut`]; only a proven deadlock is an error.
    pub fn try_lock_shared(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.try_lock(LockMode::Shared, index_id, key, timeout)
    }

    /// Non-throwing [`Locker::lock_upgradable`].
    pub fn try_lock_upgradable(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.try_lock(LockMode::Upgradable, index_id, key, timeout)
    }

    /// Non-throwing [`Locker::lock_exclusive`].
    pub fn try_lock_exclusive(
        &mut self,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.try_lock(LockMode::Exclusive, index_id, key, timeout)
    }

    /// Check this locker's ownership of `(index_id, key)`.
    #[must_use]
    pub fn lock_check(&self, index_id: u64, key: &[u8]) -> LockResult {
        self.manager.check_owner(&self.owner, index_id, key)
    }

    fn lock(
        &mut self,
        mode: LockMode,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        let (result, push) = self.manager.try_lock(mode, &self.owner, index_id, key, timeout)?;
        if let Some(push) = push {
            self.push(push);
        }
        if result.is_held() {
            Ok(result)
        } else {
            Err(self.failed(result, timeout))
        }
    }

    fn try_lock(
        &mut self,
        mode: LockMode,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        let (result, push) = self.manager.try_lock(mode, &self.owner, index_id, key, timeout)?;
        if let Some(push) = push {
            self.push(push);
        }
        if result == LockResult::TimedOut {
            if let Some(deadlock) = self.deadlock_error(timeout) {
                return Err(deadlock);
            }
        }
        Ok(result)
    }

    fn failed(&mut self, result: LockResult, timeout: Option<Duration>) -> LockError {
        match result {
            LockResult::TimedOut => self
                .deadlock_error(timeout)
                .unwrap_or(LockError::Timeout { timeout }),
            LockResult::Illegal => LockError::IllegalUpgrade,
            LockResult::Interrupted => LockError::Interrupted,
            _ => LockError::Failure("lock request failed"),
        }
    }

    /// Diagnose a timed-out wait. Consumes the published `waiting_for`
    /// either way; returns the deadlock error when a cycle was proven.
    fn deadlock_error(&mut self, timeout: Option<Duration>) -> Option<LockError> {
        if self.owner.waiting_for().is_none() {
            return None;
        }
        let found = deadlock::detect(&self.manager, &self.owner);
        self.owner.end_wait();
        found.map(|set| {
            metrics::count_deadlock();
            LockError::Deadlock {
                timeout,
                guilty: self.owner.id(),
                set,
            }
        })
    }

    // -- the scoped stack -------------------------------------------------

    fn shape(&self) -> TailShape {
        match &self.tail {
            Tail::Empty => TailShape::Empty,
            Tail::One(_) => TailShape::One,
            Tail::Blocks(block) => TailShape::Blocks {
                chain: block.chain_len(),
                top_len: block.locks.len(),
            },
        }
    }

    /// The stack holds nothing acquired in the current scope.
    fn at_scope_boundary(&self) -> bool {
        self.parent
            .as_ref()
            .is_some_and(|frame| frame.snapshot == self.shape())
    }

    fn push(&mut self, push: PushOp) {
        let PushOp { lock, upgrade } = push;
        let boundary = self.at_scope_boundary();
        match std::mem::replace(&mut self.tail, Tail::Empty) {
            Tail::Empty => {
                self.tail = if upgrade {
                    Tail::Blocks(Block::first(lock, true))
                } else {
                    Tail::One(lock)
                };
            }
            Tail::One(existing) => {
                if upgrade && existing.same_lock(&lock) && !boundary {
                    // Immediate upgrade of the top acquisition; keeping the
                    // single entry is what makes unlocking it legal.
                    self.tail = Tail::One(existing);
                } else {
                    self.tail = Tail::Blocks(Block::pair(existing, lock, upgrade));
                }
            }
            Tail::Blocks(mut block) => {
                if upgrade && block.last().same_lock(&lock) && !boundary {
                    self.tail = Tail::Blocks(block);
                } else if block.is_full() {
                    self.tail = Tail::Blocks(Block::grow(block, lock, upgrade));
                } else {
                    block.push(lock, upgrade);
                    self.tail = Tail::Blocks(block);
                }
            }
        }
    }

    /// Collapse a popped-from block back to the inline representation when
    /// possible. A single bit-clear entry in an unchained block is identical
    /// to the inline form, and scope snapshots rely on the equivalence.
    fn normalize_pop(mut block: Box<Block>) -> Tail {
        if block.locks.is_empty() {
            match block.prev.take() {
                Some(prev) => Tail::Blocks(prev),
                None => Tail::Empty,
            }
        } else if block.prev.is_none() && block.locks.len() == 1 && !block.upgrade_bit(0) {
            let lock = block.locks.pop().expect("length checked above");
            Tail::One(lock)
        } else {
            Tail::Blocks(block)
        }
    }

    /// Fully release the last lock acquired in the current scope.
    ///
    /// Releasing an entry that upgraded a lock acquired earlier would strand
    /// the earlier stack entry, so it fails; so does an unlock that would
    /// cross the current scope boundary.
    pub fn unlock(&mut self) -> Result<(), LockError> {
        if matches!(self.tail, Tail::Empty) {
            return Err(LockError::State("no locks held"));
        }
        if self.at_scope_boundary() {
            return Err(LockError::State("unlock would cross a scope boundary"));
        }
        match std::mem::replace(&mut self.tail, Tail::Empty) {
            Tail::Empty => unreachable!("checked above"),
            Tail::One(lock) => {
                if let Err(error) = self.manager.unlock(&self.owner, &lock) {
                    self.tail = Tail::One(lock);
                    return Err(error);
                }
                Ok(())
            }
            Tail::Blocks(mut block) => {
                let idx = block.locks.len() - 1;
                if block.upgrade_bit(idx) {
                    self.tail = Tail::Blocks(block);
                    return Err(LockError::State("cannot unlock non-immediate upgrade"));
                }
                if let Err(error) = self.manager.unlock(&self.owner, &block.locks[idx]) {
                    self.tail = Tail::Blocks(block);
                    return Err(error);
                }
                block.pop();
                self.tail = Self::normalize_pop(block);
                Ok(())
            }
        }
    }

    /// Demote the last acquisition to a shared hold.
    pub fn unlock_to_shared(&mut self) -> Result<(), LockError> {
        if matches!(self.tail, Tail::Empty) {
            return Err(LockError::State("no locks held"));
        }
        if self.at_scope_boundary() {
            return Err(LockError::State("unlock would cross a scope boundary"));
        }
        match &self.tail {
            Tail::Empty => unreachable!("checked above"),
            Tail::One(lock) => self.manager.unlock_to_shared(&self.owner, lock),
            Tail::Blocks(block) => {
                let idx = block.locks.len() - 1;
                if block.upgrade_bit(idx) {
                    return Err(LockError::State("cannot unlock non-immediate upgrade"));
                }
                self.manager.unlock_to_shared(&self.owner, &block.locks[idx])
            }
        }
    }

    /// Demote the last acquisition or promotion to an upgradable hold.
    pub fn unlock_to_upgradable(&mut self) -> Result<(), LockError> {
        if matches!(self.tail, Tail::Empty) {
            return Err(LockError::State("no locks held"));
        }
        if self.at_scope_boundary() {
            return Err(LockError::State("unlock would cross a scope boundary"));
        }
        match std::mem::replace(&mut self.tail, Tail::Empty) {
            Tail::Empty => unreachable!("checked above"),
            Tail::One(lock) => {
                let outcome = self.manager.unlock_to_upgradable(&self.owner, &lock);
                self.tail = Tail::One(lock);
                outcome
            }
            Tail::Blocks(mut block) => {
                let idx = block.locks.len() - 1;
                let outcome = self.manager.unlock_to_upgradable(&self.owner, &block.locks[idx]);
                if outcome.is_ok() && block.upgrade_bit(idx) {
                    // The promotion entry is consumed; the earlier entry
                    // still records the upgradable hold.
                    block.pop();
                    self.tail = Self::normalize_pop(block);
                } else {
                    self.tail = Tail::Blocks(block);
                }
                outcome
            }
        }
    }

    // -- scopes -----------------------------------------------------------

    /// True if the current transaction scope is nested.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    /// Nesting depth; zero when non-nested.
    #[must_use]
    pub fn nesting_level(&self) -> usize {
        let mut level = 0;
        let mut frame = self.parent.as_deref();
        while let Some(scope) = frame {
            level += 1;
            frame = scope.parent.as_deref();
        }
        level
    }

    /// Open a nested scope. Locks acquired from here on are released by the
    /// matching [`Locker::scope_exit`].
    pub fn scope_enter(&mut self) {
        let frame = ParentScope {
            parent: self.parent.take(),
            snapshot: self.shape(),
            saved_timeout: self.timeout,
        };
        self.parent = Some(Box::new(frame));
    }

    /// Merge the current scope's acquisitions into the enclosing scope.
    pub fn promote(&mut self) {
        let shape = self.shape();
        if !matches!(self.tail, Tail::Empty) {
            if let Some(frame) = &mut self.parent {
                frame.snapshot = shape;
            }
        }
    }

    /// Release everything acquired in the current scope without closing it.
    pub fn scope_unlock_all(&mut self) {
        let target = self
            .parent
            .as_ref()
            .map_or(TailShape::Empty, |frame| frame.snapshot);
        self.unlock_to_shape(target);
    }

    /// Close the current scope, restoring the lock set of the matching
    /// [`Locker::scope_enter`].
    pub fn scope_exit(&mut self) {
        self.scope_unlock_all();
        if let Some(frame) = self.parent.take() {
            self.parent = frame.parent;
            self.timeout = frame.saved_timeout;
        }
    }

    /// Release all held locks and close every scope.
    pub fn scope_exit_all(&mut self) {
        let mut outermost_timeout = None;
        while let Some(frame) = self.parent.take() {
            outermost_timeout = Some(frame.saved_timeout);
            self.parent = frame.parent;
        }
        if let Some(timeout) = outermost_timeout {
            self.timeout = timeout;
        }
        self.unlock_to_shape(TailShape::Empty);
    }

    fn unlock_to_shape(&mut self, target: TailShape) {
        loop {
            if self.shape() == target {
                return;
            }
            match std::mem::replace(&mut self.tail, Tail::Empty) {
                Tail::Empty => return,
                Tail::One(lock) => {
                    if let Err(error) = self.manager.unlock(&self.owner, &lock) {
                        warn!(%error, "scope release failed");
                    }
                }
                Tail::Blocks(mut block) => {
                    let idx = block.locks.len() - 1;
                    let demote = block.upgrade_bit(idx);
                    let lock = block.pop().expect("blocks are never empty at rest");
                    let outcome = if demote {
                        self.manager.unlock_to_upgradable(&self.owner, &lock)
                    } else {
                        self.manager.unlock(&self.owner, &lock)
                    };
                    if let Err(error) = outcome {
                        warn!(%error, "scope release failed");
                    }
                    self.tail = Self::normalize_pop(block);
                }
            }
        }
    }

    // -- commit support ---------------------------------------------------

    /// Detach every exclusive hold onto a [`PendingTxn`] and release the
    /// rest. Requires the top scope: nested scopes must be exited (or
    /// promoted) first.
    pub fn transfer_exclusive(&mut self) -> Result<PendingTxn, LockError> {
        if self.parent.is_some() {
            return Err(LockError::State(
                "cannot transfer exclusive locks with nested scopes",
            ));
        }
        let pending_owner = OwnerHandle::new();
        let mut transferred = Vec::new();
        let mut tail = std::mem::replace(&mut self.tail, Tail::Empty);
        loop {
            match tail {
                Tail::Empty => break,
                Tail::One(lock) => {
                    match self
                        .manager
                        .transfer_or_release(&self.owner, &lock, &pending_owner)
                    {
                        Ok(true) => transferred.push(lock),
                        Ok(false) => {}
                        Err(error) => warn!(%error, "commit transfer release failed"),
                    }
                    break;
                }
                Tail::Blocks(mut block) => {
                    while let Some(lock) = block.pop() {
                        match self
                            .manager
                            .transfer_or_release(&self.owner, &lock, &pending_owner)
                        {
                            Ok(true) => transferred.push(lock),
                            Ok(false) => {}
                            Err(error) => warn!(%error, "commit transfer release failed"),
                        }
                    }
                    tail = match block.prev.take() {
                        Some(prev) => Tail::Blocks(prev),
                        None => Tail::Empty,
                    };
                }
            }
        }
        Ok(PendingTxn::new(
            Arc::clone(&self.manager),
            pending_owner,
            transferred,
        ))
    }

    /// Abandon the stack without releasing anything. The held locks leak
    /// deliberately; only for fatal paths where releasing might publish
    /// inconsistent state.
    pub fn discard_all_locks(&mut self) {
        warn!(locker = self.owner.id(), "discarding lock stack without release");
        self.parent = None;
        self.tail = Tail::Empty;
    }

    // -- inspection -------------------------------------------------------

    fn peek(&self) -> Result<&LockRef, LockError> {
        match &self.tail {
            Tail::Empty => Err(LockError::State("no locks held")),
            Tail::One(lock) => Ok(lock),
            Tail::Blocks(block) => Ok(block.last()),
        }
    }

    /// Index id of the last lock acquired in the current scope.
    pub fn last_locked_index(&self) -> Result<u64, LockError> {
        Ok(self.peek()?.index_id())
    }

    /// Key of the last lock acquired in the current scope.
    pub fn last_locked_key(&self) -> Result<&[u8], LockError> {
        Ok(self.peek()?.key())
    }

    /// Number of entries on the stack (promotions of an already-held lock
    /// count separately).
    #[must_use]
    pub fn held_entry_count(&self) -> usize {
        match &self.tail {
            Tail::Empty => 0,
            Tail::One(_) => 1,
            Tail::Blocks(block) => {
                let mut count = block.locks.len();
                let mut frame = block.prev.as_deref();
                while let Some(prev) = frame {
                    count += prev.locks.len();
                    frame = prev.prev.as_deref();
                }
                count
            }
        }
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.scope_exit_all();
    }
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("id", &self.owner.id())
            .field("entries", &self.held_entry_count())
            .field("nesting", &self.nesting_level())
            .finish_non_exhaustive()
    }
}
