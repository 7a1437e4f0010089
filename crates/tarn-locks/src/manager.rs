//! Sharded lock table and the top-level lock/unlock entry points.
//!
//! The manager owns a fixed power-of-two array of shards, each a [`Latch`]
//! over that shard's lock records. The `(index_id, key)` hash picks the
//! shard; all record mutation happens under the shard latch held exclusively
//! (lookups too, for simplicity). Threads park only after the latch is
//! dropped, with the request queued on the record and the locker's
//! `waiting_for` published for the deadlock detector.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tarn_sync::{CacheAligned, Latch};
use tracing::trace;

use crate::entry::{AcquireStep, LockEntry, LockWaiter, UpgradableUndo};
use crate::error::LockError;
use crate::key::{key_hash, LockRef};
use crate::locker::Locker;
use crate::metrics;
use crate::owner::OwnerHandle;
use crate::result::{LockResult, UpgradeRule};

/// Construction options for a [`LockManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockManagerOptions {
    /// Shard count, rounded up to a power of two. Defaults to 4× the
    /// available cores.
    pub shard_count: Option<usize>,
    /// Policy for shared-to-upgradable promotion.
    pub upgrade_rule: UpgradeRule,
    /// Wait bound applied by lockers that do not override it. `None` waits
    /// forever.
    pub default_timeout: Option<Duration>,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        Self {
            shard_count: None,
            upgrade_rule: UpgradeRule::Strict,
            default_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Requested lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Upgradable,
    Exclusive,
}

/// A stack push the locker owes after a successful acquisition.
pub(crate) struct PushOp {
    pub(crate) lock: LockRef,
    pub(crate) upgrade: bool,
}

/// Outcome of a manager-level try-lock: the result plus the owed push.
pub(crate) type TryLockOutcome = (LockResult, Option<PushOp>);

#[derive(Default)]
struct ShardTable {
    /// Records nested by index id, then key bytes. Map growth under the
    /// exclusive shard latch stands in for hand-rolled table resizing.
    indexes: HashMap<u64, HashMap<Arc<[u8]>, LockEntry>>,
}

impl ShardTable {
    fn get_mut(&mut self, index_id: u64, key: &[u8]) -> Option<&mut LockEntry> {
        self.indexes.get_mut(&index_id)?.get_mut(key)
    }

    fn get_or_insert(&mut self, index_id: u64, key: &[u8], hash: u32) -> &mut LockEntry {
        let inner = self.indexes.entry(index_id).or_default();
        if !inner.contains_key(key) {
            // First acquisition: the key bytes move into a buffer shared by
            // the record and every stack entry referencing it.
            let owned: Arc<[u8]> = Arc::from(key);
            inner.insert(Arc::clone(&owned), LockEntry::new(index_id, owned, hash));
        }
        inner.get_mut(key).expect("record ensured above")
    }

    fn remove(&mut self, index_id: u64, key: &[u8]) {
        if let Some(inner) = self.indexes.get_mut(&index_id) {
            inner.remove(key);
            if inner.is_empty() {
                self.indexes.remove(&index_id);
            }
        }
    }

    fn remove_if_dead(&mut self, index_id: u64, key: &[u8]) {
        if self.get_mut(index_id, key).is_some_and(|entry| entry.is_dead()) {
            self.remove(index_id, key);
        }
    }
}

enum WaitOutcome {
    Granted,
    TimedOut,
    Interrupted,
}

/// Sharded table of key-range locks.
pub struct LockManager {
    shards: Box<[CacheAligned<Latch<ShardTable>>]>,
    shard_mask: u32,
    upgrade_rule: UpgradeRule,
    default_timeout: Option<Duration>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(LockManagerOptions::default())
    }

    #[must_use]
    pub fn with_options(options: LockManagerOptions) -> Self {
        let cores = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let shards = options
            .shard_count
            .unwrap_or(cores * 4)
            .max(1)
            .next_power_of_two();
        let shards = (0..shards)
            .map(|_| CacheAligned::new(Latch::new(ShardTable::default())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let shard_mask = shards.len() as u32 - 1;
        Self {
            shards,
            shard_mask,
            upgrade_rule: options.upgrade_rule,
            default_timeout: options.default_timeout,
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn upgrade_rule(&self) -> UpgradeRule {
        self.upgrade_rule
    }

    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    fn shard(&self, hash: u32) -> &Latch<ShardTable> {
        &self.shards[(hash & self.shard_mask) as usize]
    }

    // -- public delegates -------------------------------------------------

    /// Check `locker`'s ownership of `(index_id, key)`.
    #[must_use]
    pub fn check(&self, locker: &Locker, index_id: u64, key: &[u8]) -> LockResult {
        self.check_owner(locker.owner_handle(), index_id, key)
    }

    /// Acquire a shared lock on behalf of `locker`. See
    /// [`Locker::lock_shared`].
    pub fn lock_shared(
        &self,
        locker: &mut Locker,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.ensure_same_manager(locker)?;
        locker.lock_shared(index_id, key, timeout)
    }

    /// Acquire an upgradable lock on behalf of `locker`. See
    /// [`Locker::lock_upgradable`].
    pub fn lock_upgradable(
        &self,
        locker: &mut Locker,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.ensure_same_manager(locker)?;
        locker.lock_upgradable(index_id, key, timeout)
    }

    /// Acquire an exclusive lock on behalf of `locker`. See
    /// [`Locker::lock_exclusive`].
    pub fn lock_exclusive(
        &self,
        locker: &mut Locker,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.ensure_same_manager(locker)?;
        locker.lock_exclusive(index_id, key, timeout)
    }

    /// Non-throwing [`LockManager::lock_shared`]; see
    /// [`Locker::try_lock_shared`].
    pub fn try_lock_shared(
        &self,
        locker: &mut Locker,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.ensure_same_manager(locker)?;
        locker.try_lock_shared(index_id, key, timeout)
    }

    /// Non-throwing [`LockManager::lock_upgradable`].
    pub fn try_lock_upgradable(
        &self,
        locker: &mut Locker,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.ensure_same_manager(locker)?;
        locker.try_lock_upgradable(index_id, key, timeout)
    }

    /// Non-throwing [`LockManager::lock_exclusive`].
    pub fn try_lock_exclusive(
        &self,
        locker: &mut Locker,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<LockResult, LockError> {
        self.ensure_same_manager(locker)?;
        locker.try_lock_exclusive(index_id, key, timeout)
    }

    /// Detach `locker`'s exclusive holds for asynchronous commit. See
    /// [`Locker::transfer_exclusive`].
    pub fn transfer_exclusive(&self, locker: &mut Locker) -> Result<crate::PendingTxn, LockError> {
        self.ensure_same_manager(locker)?;
        locker.transfer_exclusive()
    }

    fn ensure_same_manager(&self, locker: &Locker) -> Result<(), LockError> {
        if std::ptr::eq(Arc::as_ptr(locker.manager()), self) {
            Ok(())
        } else {
            Err(LockError::Failure("locker belongs to a different manager"))
        }
    }

    pub(crate) fn check_owner(
        &self,
        owner: &Arc<OwnerHandle>,
        index_id: u64,
        key: &[u8],
    ) -> LockResult {
        let hash = key_hash(index_id, key);
        let mut table = self.shard(hash).write();
        match table.get_mut(index_id, key) {
            Some(entry) => entry.check(owner),
            None => LockResult::Unowned,
        }
    }

    // -- acquisition ------------------------------------------------------

    pub(crate) fn try_lock(
        &self,
        mode: LockMode,
        owner: &Arc<OwnerHandle>,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> Result<TryLockOutcome, LockError> {
        let hash = key_hash(index_id, key);
        let deadline = timeout.map(|t| Instant::now() + t);
        let immediate_only = timeout.is_some_and(|t| t.is_zero());
        match mode {
            LockMode::Shared | LockMode::Upgradable => {
                self.lock_single_phase(mode, owner, index_id, key, hash, deadline, immediate_only)
            }
            LockMode::Exclusive => {
                self.lock_exclusive_internal(owner, index_id, key, hash, deadline, immediate_only)
            }
        }
    }

    /// Shared and upgradable requests resolve in one wait at most.
    #[allow(clippy::too_many_arguments)]
    fn lock_single_phase(
        &self,
        mode: LockMode,
        owner: &Arc<OwnerHandle>,
        index_id: u64,
        key: &[u8],
        hash: u32,
        deadline: Option<Instant>,
        immediate_only: bool,
    ) -> Result<TryLockOutcome, LockError> {
        let (lock_ref, waiter) = {
            let mut table = self.shard(hash).write();
            let entry = table.get_or_insert(index_id, key, hash);
            let lock_ref = entry.lock_ref();
            let step = match mode {
                LockMode::Shared => entry.try_shared(owner),
                LockMode::Upgradable => entry.try_upgradable(owner, self.upgrade_rule),
                LockMode::Exclusive => unreachable!("exclusive uses the two-phase path"),
            };
            match step {
                AcquireStep::Done { result, push } => {
                    table.remove_if_dead(index_id, key);
                    if result == LockResult::Acquired {
                        metrics::count_acquired();
                    }
                    return Ok((
                        result,
                        push.map(|upgrade| PushOp {
                            lock: lock_ref,
                            upgrade,
                        }),
                    ));
                }
                AcquireStep::Wait { waiter } => {
                    owner.begin_wait(lock_ref.clone());
                    if immediate_only {
                        // Zero timeout: never park, but leave `waiting_for`
                        // published so the caller can diagnose deadlock.
                        let entry = table.get_or_insert(index_id, key, hash);
                        entry.cancel_waiter(&waiter);
                        entry.wake_waiters();
                        table.remove_if_dead(index_id, key);
                        metrics::count_timeout();
                        return Ok((LockResult::TimedOut, None));
                    }
                    (lock_ref, waiter)
                }
                AcquireStep::Fail(reason) => {
                    table.remove_if_dead(index_id, key);
                    return Err(LockError::State(reason));
                }
            }
        };

        metrics::count_wait();
        trace!(index_id, hash, ?mode, "parking on contended lock");
        match self.wait(owner, &waiter, deadline) {
            WaitOutcome::Granted => {
                owner.end_wait();
                metrics::count_acquired();
                Ok((
                    waiter.result,
                    Some(PushOp {
                        lock: lock_ref,
                        upgrade: waiter.push_upgrade,
                    }),
                ))
            }
            WaitOutcome::TimedOut => {
                if self.cancel_wait(owner, &lock_ref, &waiter, UpgradableUndo::Keep) {
                    owner.end_wait();
                    metrics::count_acquired();
                    return Ok((
                        waiter.result,
                        Some(PushOp {
                            lock: lock_ref,
                            upgrade: waiter.push_upgrade,
                        }),
                    ));
                }
                // `waiting_for` stays set for the deadlock detector.
                metrics::count_timeout();
                Ok((LockResult::TimedOut, None))
            }
            WaitOutcome::Interrupted => {
                if self.cancel_wait(owner, &lock_ref, &waiter, UpgradableUndo::Keep) {
                    owner.end_wait();
                    metrics::count_acquired();
                    return Ok((
                        waiter.result,
                        Some(PushOp {
                            lock: lock_ref,
                            upgrade: waiter.push_upgrade,
                        }),
                    ));
                }
                owner.take_interrupted();
                owner.end_wait();
                Ok((LockResult::Interrupted, None))
            }
        }
    }

    /// Exclusive acquisition: take the upgradable mode first (waiting if
    /// necessary), then convert once the shared count drains.
    #[allow(clippy::too_many_arguments)]
    fn lock_exclusive_internal(
        &self,
        owner: &Arc<OwnerHandle>,
        index_id: u64,
        key: &[u8],
        hash: u32,
        deadline: Option<Instant>,
        immediate_only: bool,
    ) -> Result<TryLockOutcome, LockError> {
        // Phase 1 state: the base result of the upgradable hold, the push
        // bit owed for it, and how to undo it if phase 2 fails.
        let mut phase1: Option<(LockResult, bool, UpgradableUndo)> = None;

        loop {
            // Set when the request must park: the lock, the queued waiter,
            // and whether this is the exclusive-conversion phase.
            let mut pending: Option<(LockRef, Arc<LockWaiter>, bool)> = None;

            {
                let mut table = self.shard(hash).write();
                let entry = table.get_or_insert(index_id, key, hash);
                let lock_ref = entry.lock_ref();

                if phase1.is_none() {
                    match entry.check(owner) {
                        LockResult::OwnedExclusive => {
                            return Ok((LockResult::OwnedExclusive, None));
                        }
                        LockResult::OwnedUpgradable => {
                            phase1 =
                                Some((LockResult::OwnedUpgradable, true, UpgradableUndo::Keep));
                        }
                        held => {
                            let from_shared = held == LockResult::OwnedShared;
                            match entry.try_upgradable(owner, self.upgrade_rule) {
                                AcquireStep::Done {
                                    result: LockResult::Illegal,
                                    ..
                                } => {
                                    table.remove_if_dead(index_id, key);
                                    return Ok((LockResult::Illegal, None));
                                }
                                AcquireStep::Done { push, .. } => {
                                    let undo = if from_shared {
                                        UpgradableUndo::RestoreShared
                                    } else {
                                        UpgradableUndo::Release
                                    };
                                    phase1 =
                                        Some((LockResult::Acquired, push.unwrap_or(false), undo));
                                }
                                AcquireStep::Wait { waiter } => {
                                    owner.begin_wait(lock_ref.clone());
                                    if immediate_only {
                                        entry.cancel_waiter(&waiter);
                                        entry.wake_waiters();
                                        table.remove_if_dead(index_id, key);
                                        metrics::count_timeout();
                                        return Ok((LockResult::TimedOut, None));
                                    }
                                    pending = Some((lock_ref.clone(), waiter, false));
                                }
                                AcquireStep::Fail(reason) => {
                                    table.remove_if_dead(index_id, key);
                                    return Err(LockError::State(reason));
                                }
                            }
                        }
                    }
                }

                if pending.is_none() {
                    let (base, push_upgrade, undo) =
                        phase1.expect("phase 1 resolved before conversion");
                    let (result, upgrade) = if base == LockResult::OwnedUpgradable {
                        (LockResult::Upgraded, true)
                    } else {
                        (LockResult::Acquired, push_upgrade)
                    };
                    if entry.try_convert_exclusive(owner) {
                        owner.end_wait();
                        metrics::count_acquired();
                        return Ok((
                            result,
                            Some(PushOp {
                                lock: lock_ref,
                                upgrade,
                            }),
                        ));
                    }
                    // Shared holders remain; queue the conversion.
                    let waiter = entry.enqueue_exclusive(owner, result, upgrade);
                    owner.begin_wait(lock_ref.clone());
                    if immediate_only {
                        entry.cancel_waiter(&waiter);
                        entry.undo_upgradable(owner, undo);
                        entry.wake_waiters();
                        table.remove_if_dead(index_id, key);
                        metrics::count_timeout();
                        return Ok((LockResult::TimedOut, None));
                    }
                    pending = Some((lock_ref, waiter, true));
                }
            }

            let (lock_ref, waiter, exclusive_phase) =
                pending.expect("wait state set before parking");

            metrics::count_wait();
            trace!(index_id, hash, exclusive_phase, "parking on contended lock");
            let undo = if exclusive_phase {
                phase1.map_or(UpgradableUndo::Keep, |(_, _, undo)| undo)
            } else {
                UpgradableUndo::Keep
            };

            match self.wait(owner, &waiter, deadline) {
                WaitOutcome::Granted => {
                    owner.end_wait();
                    if exclusive_phase {
                        metrics::count_acquired();
                        return Ok((
                            waiter.result,
                            Some(PushOp {
                                lock: lock_ref,
                                upgrade: waiter.push_upgrade,
                            }),
                        ));
                    }
                    // Upgradable granted; loop into phase 2.
                    let undo = if waiter.convert_from_shared {
                        UpgradableUndo::RestoreShared
                    } else {
                        UpgradableUndo::Release
                    };
                    phase1 = Some((LockResult::Acquired, waiter.push_upgrade, undo));
                }
                WaitOutcome::TimedOut => {
                    if self.cancel_wait(owner, &lock_ref, &waiter, undo) {
                        // The grant won the race. A granted conversion means
                        // the lock is held; a granted upgradable is rolled
                        // back because the request as a whole timed out.
                        if exclusive_phase {
                            owner.end_wait();
                            metrics::count_acquired();
                            return Ok((
                                waiter.result,
                                Some(PushOp {
                                    lock: lock_ref,
                                    upgrade: waiter.push_upgrade,
                                }),
                            ));
                        }
                        let late_undo = if waiter.convert_from_shared {
                            UpgradableUndo::RestoreShared
                        } else {
                            UpgradableUndo::Release
                        };
                        self.rollback_upgradable(owner, &lock_ref, late_undo);
                    }
                    metrics::count_timeout();
                    return Ok((LockResult::TimedOut, None));
                }
                WaitOutcome::Interrupted => {
                    if self.cancel_wait(owner, &lock_ref, &waiter, undo) {
                        if exclusive_phase {
                            owner.end_wait();
                            metrics::count_acquired();
                            return Ok((
                                waiter.result,
                                Some(PushOp {
                                    lock: lock_ref,
                                    upgrade: waiter.push_upgrade,
                                }),
                            ));
                        }
                        let late_undo = if waiter.convert_from_shared {
                            UpgradableUndo::RestoreShared
                        } else {
                            UpgradableUndo::Release
                        };
                        self.rollback_upgradable(owner, &lock_ref, late_undo);
                    }
                    owner.take_interrupted();
                    owner.end_wait();
                    return Ok((LockResult::Interrupted, None));
                }
            }
        }
    }

    fn wait(
        &self,
        owner: &Arc<OwnerHandle>,
        waiter: &Arc<LockWaiter>,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        loop {
            if waiter.is_granted() {
                return WaitOutcome::Granted;
            }
            if owner.is_interrupted() {
                return WaitOutcome::Interrupted;
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    /// Remove an aborted waiter under the shard latch. Returns true when a
    /// concurrent grant won, in which case nothing was removed.
    fn cancel_wait(
        &self,
        owner: &Arc<OwnerHandle>,
        lock: &LockRef,
        waiter: &Arc<LockWaiter>,
        undo: UpgradableUndo,
    ) -> bool {
        let mut table = self.shard(lock.hash).write();
        let Some(entry) = table.get_mut(lock.index_id, &lock.key) else {
            return waiter.is_granted();
        };
        if !entry.cancel_waiter(waiter) {
            return true;
        }
        entry.undo_upgradable(owner, undo);
        entry.wake_waiters();
        table.remove_if_dead(lock.index_id, &lock.key);
        false
    }

    /// Roll back an upgradable hold granted after its request already gave
    /// up (the grant/timeout race resolved in the grant's favor).
    fn rollback_upgradable(&self, owner: &Arc<OwnerHandle>, lock: &LockRef, undo: UpgradableUndo) {
        let mut table = self.shard(lock.hash).write();
        if let Some(entry) = table.get_mut(lock.index_id, &lock.key) {
            entry.undo_upgradable(owner, undo);
            entry.wake_waiters();
            table.remove_if_dead(lock.index_id, &lock.key);
        }
    }

    // -- release ----------------------------------------------------------

    pub(crate) fn unlock(&self, owner: &Arc<OwnerHandle>, lock: &LockRef) -> Result<(), LockError> {
        let mut table = self.shard(lock.hash).write();
        let entry = table
            .get_mut(lock.index_id, &lock.key)
            .ok_or(LockError::State("lock not held"))?;
        entry.unlock(owner)?;
        table.remove_if_dead(lock.index_id, &lock.key);
        Ok(())
    }

    pub(crate) fn unlock_to_shared(
        &self,
        owner: &Arc<OwnerHandle>,
        lock: &LockRef,
    ) -> Result<(), LockError> {
        let mut table = self.shard(lock.hash).write();
        let entry = table
            .get_mut(lock.index_id, &lock.key)
            .ok_or(LockError::State("lock not held"))?;
        entry.unlock_to_shared(owner)
    }

    pub(crate) fn unlock_to_upgradable(
        &self,
        owner: &Arc<OwnerHandle>,
        lock: &LockRef,
    ) -> Result<(), LockError> {
        let mut table = self.shard(lock.hash).write();
        let entry = table
            .get_mut(lock.index_id, &lock.key)
            .ok_or(LockError::State("lock not held"))?;
        entry.unlock_to_upgradable(owner)
    }

    /// Transfer an exclusive hold to `to`, or release a weaker hold.
    /// Returns true when the lock now belongs to `to` and should ride on the
    /// pending transaction.
    pub(crate) fn transfer_or_release(
        &self,
        owner: &Arc<OwnerHandle>,
        lock: &LockRef,
        to: &Arc<OwnerHandle>,
    ) -> Result<bool, LockError> {
        let mut table = self.shard(lock.hash).write();
        let entry = table
            .get_mut(lock.index_id, &lock.key)
            .ok_or(LockError::State("lock not held"))?;
        match entry.transfer_exclusive(owner, to) {
            Some(transferred) => Ok(transferred),
            None => {
                entry.unlock(owner)?;
                table.remove_if_dead(lock.index_id, &lock.key);
                Ok(false)
            }
        }
    }

    // -- deadlock support -------------------------------------------------

    /// Holders of `lock` other than `skip`, or `None` when the shard latch
    /// could not be taken without blocking.
    pub(crate) fn try_holders_of(
        &self,
        lock: &LockRef,
        skip: u64,
    ) -> Option<Vec<Arc<OwnerHandle>>> {
        let mut table = self.shard(lock.hash).try_write()?;
        match table.get_mut(lock.index_id, &lock.key) {
            Some(entry) => Some(
                entry
                    .holders()
                    .filter(|holder| holder.id() != skip)
                    .cloned()
                    .collect(),
            ),
            None => Some(Vec::new()),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("shards", &self.shards.len())
            .field("upgrade_rule", &self.upgrade_rule)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
