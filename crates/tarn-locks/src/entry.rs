//! Per-key lock records.
//!
//! One [`LockEntry`] exists per currently held or contended `(index_id, key)`
//! pair, living in its shard's table and mutated only under the shard latch.
//! The count word uses sentinel encodings:
//!
//! - `0`: unheld (the record is about to be removed);
//! - `1..=0x7fff_fffe`: shared count;
//! - `0x8000_0000 | shared`: upgradable held, plus shared count;
//! - `0xffff_ffff`: exclusive held.
//!
//! Waiters are granted by the releaser while it still holds the shard latch:
//! the releaser mutates the record on the waiter's behalf, marks the node
//! granted and unparks it. The woken thread finds its result on the node
//! rather than re-running the acquisition, which keeps grants FIFO per mode
//! regardless of wake-up scheduling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use smallvec::SmallVec;

use crate::key::LockRef;
use crate::owner::OwnerHandle;
use crate::result::{LockResult, UpgradeRule};

/// Upgradable-held flag of the count word.
pub(crate) const UPGRADE_FLAG: u32 = 0x8000_0000;

/// Exclusive-held sentinel.
pub(crate) const EXCLUSIVE: u32 = u32::MAX;

/// Shared holds beyond this would collide with the sentinels.
const MAX_SHARED: u32 = 0x7fff_fffe;

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitMode {
    Shared,
    Upgradable,
    Exclusive,
}

/// A parked lock request, queued on the entry and held by the waiting
/// thread. The grant-time result and stack push bit are fixed at enqueue.
pub(crate) struct LockWaiter {
    pub(crate) owner: Arc<OwnerHandle>,
    thread: Thread,
    pub(crate) mode: WaitMode,
    state: AtomicU8,
    /// Result reported when granted.
    pub(crate) result: LockResult,
    /// Upgrade bit for the stack push performed on grant.
    pub(crate) push_upgrade: bool,
    /// Grant converts the owner's existing shared hold into the upgradable.
    pub(crate) convert_from_shared: bool,
}

impl LockWaiter {
    fn new(
        owner: &Arc<OwnerHandle>,
        mode: WaitMode,
        result: LockResult,
        push_upgrade: bool,
        convert_from_shared: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            owner: Arc::clone(owner),
            thread: thread::current(),
            mode,
            state: AtomicU8::new(WAITING),
            result,
            push_upgrade,
            convert_from_shared,
        })
    }

    pub(crate) fn is_granted(&self) -> bool {
        self.state.load(Ordering::Acquire) == GRANTED
    }

    fn grant(&self) {
        self.state.store(GRANTED, Ordering::Release);
        self.thread.unpark();
    }
}

/// One step of an acquisition attempt, taken under the shard latch.
pub(crate) enum AcquireStep {
    /// Resolved without waiting. `push` carries the stack push's upgrade bit
    /// when the caller newly acquired (or promoted) the lock.
    Done {
        result: LockResult,
        push: Option<bool>,
    },
    /// The request was queued; the caller must park on the waiter.
    Wait { waiter: Arc<LockWaiter> },
    /// Structural refusal (shared count exhausted).
    Fail(&'static str),
}

/// How to roll back a freshly acquired upgradable hold when the exclusive
/// conversion it was acquired for times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradableUndo {
    /// The hold predates this request; leave it.
    Keep,
    /// Fresh acquisition; clear it.
    Release,
    /// Fresh conversion of a shared hold; restore the shared hold.
    RestoreShared,
}

pub(crate) struct LockEntry {
    pub(crate) index_id: u64,
    pub(crate) key: Arc<[u8]>,
    pub(crate) hash: u32,
    count: u32,
    owner: Option<Arc<OwnerHandle>>,
    shared_owners: SmallVec<[Arc<OwnerHandle>; 1]>,
    /// Waiting upgradable requests.
    queue_u: VecDeque<Arc<LockWaiter>>,
    /// Waiting shared requests and the (at most one) exclusive conversion.
    queue_sx: VecDeque<Arc<LockWaiter>>,
}

impl LockEntry {
    pub(crate) fn new(index_id: u64, key: Arc<[u8]>, hash: u32) -> Self {
        Self {
            index_id,
            key,
            hash,
            count: 0,
            owner: None,
            shared_owners: SmallVec::new(),
            queue_u: VecDeque::new(),
            queue_sx: VecDeque::new(),
        }
    }

    pub(crate) fn lock_ref(&self) -> LockRef {
        LockRef {
            index_id: self.index_id,
            key: Arc::clone(&self.key),
            hash: self.hash,
        }
    }

    fn owner_is(&self, owner: &Arc<OwnerHandle>) -> bool {
        self.owner.as_ref().is_some_and(|held| held.id() == owner.id())
    }

    fn shared_index(&self, owner: &Arc<OwnerHandle>) -> Option<usize> {
        self.shared_owners.iter().position(|held| held.id() == owner.id())
    }

    fn shared_count(&self) -> u32 {
        if self.count == EXCLUSIVE {
            0
        } else {
            self.count & !UPGRADE_FLAG
        }
    }

    /// Ownership check for `owner`.
    pub(crate) fn check(&self, owner: &Arc<OwnerHandle>) -> LockResult {
        if self.owner_is(owner) {
            if self.count == EXCLUSIVE {
                LockResult::OwnedExclusive
            } else {
                LockResult::OwnedUpgradable
            }
        } else if self.shared_index(owner).is_some() {
            LockResult::OwnedShared
        } else {
            LockResult::Unowned
        }
    }

    /// The record can be removed from its shard.
    pub(crate) fn is_dead(&self) -> bool {
        self.count == 0
            && self.owner.is_none()
            && self.shared_owners.is_empty()
            && self.queue_u.is_empty()
            && self.queue_sx.is_empty()
    }

    /// Current holders, for the deadlock detector.
    pub(crate) fn holders(&self) -> impl Iterator<Item = &Arc<OwnerHandle>> {
        self.owner.iter().chain(self.shared_owners.iter())
    }

    // -- acquisition ------------------------------------------------------

    pub(crate) fn try_shared(&mut self, owner: &Arc<OwnerHandle>) -> AcquireStep {
        let held = self.check(owner);
        if held != LockResult::Unowned {
            return AcquireStep::Done {
                result: held,
                push: None,
            };
        }
        if self.count != EXCLUSIVE && self.queue_sx.is_empty() {
            if self.shared_count() >= MAX_SHARED {
                return AcquireStep::Fail("too many shared locks");
            }
            self.shared_owners.push(Arc::clone(owner));
            self.count += 1;
            return AcquireStep::Done {
                result: LockResult::Acquired,
                push: Some(false),
            };
        }
        // Exclusively held, or a queued exclusive conversion gates new
        // readers on this key.
        let waiter = LockWaiter::new(owner, WaitMode::Shared, LockResult::Acquired, false, false);
        self.queue_sx.push_back(Arc::clone(&waiter));
        AcquireStep::Wait { waiter }
    }

    pub(crate) fn try_upgradable(
        &mut self,
        owner: &Arc<OwnerHandle>,
        rule: UpgradeRule,
    ) -> AcquireStep {
        let held = self.check(owner);
        if held.already_owned() && held != LockResult::OwnedShared {
            return AcquireStep::Done {
                result: held,
                push: None,
            };
        }
        let from_shared = held == LockResult::OwnedShared;
        if from_shared {
            let permitted = match rule {
                UpgradeRule::Unchecked => true,
                UpgradeRule::Lenient => self.shared_count() == 1,
                UpgradeRule::Strict => false,
            };
            if !permitted {
                return AcquireStep::Done {
                    result: LockResult::Illegal,
                    push: None,
                };
            }
        }
        if self.owner.is_none() && self.count != EXCLUSIVE && self.queue_u.is_empty() {
            if from_shared {
                self.convert_shared_to_upgradable(owner);
            } else {
                self.owner = Some(Arc::clone(owner));
                self.count |= UPGRADE_FLAG;
            }
            return AcquireStep::Done {
                result: LockResult::Acquired,
                push: Some(from_shared),
            };
        }
        let waiter = LockWaiter::new(
            owner,
            WaitMode::Upgradable,
            LockResult::Acquired,
            from_shared,
            from_shared,
        );
        self.queue_u.push_back(Arc::clone(&waiter));
        AcquireStep::Wait { waiter }
    }

    /// Convert the caller's upgradable hold to exclusive if no shared holds
    /// remain. The caller must already own the upgradable mode.
    pub(crate) fn try_convert_exclusive(&mut self, owner: &Arc<OwnerHandle>) -> bool {
        if self.count == UPGRADE_FLAG && self.owner_is(owner) {
            self.count = EXCLUSIVE;
            true
        } else {
            false
        }
    }

    /// Queue the exclusive conversion; at most one can exist per entry since
    /// the upgradable mode is unique.
    pub(crate) fn enqueue_exclusive(
        &mut self,
        owner: &Arc<OwnerHandle>,
        result: LockResult,
        push_upgrade: bool,
    ) -> Arc<LockWaiter> {
        debug_assert!(self.owner_is(owner));
        let waiter = LockWaiter::new(owner, WaitMode::Exclusive, result, push_upgrade, false);
        self.queue_sx.push_back(Arc::clone(&waiter));
        waiter
    }

    fn convert_shared_to_upgradable(&mut self, owner: &Arc<OwnerHandle>) {
        if let Some(i) = self.shared_index(owner) {
            self.shared_owners.swap_remove(i);
            self.count -= 1;
        }
        self.owner = Some(Arc::clone(owner));
        self.count |= UPGRADE_FLAG;
    }

    /// Roll back an upgradable hold acquired for a failed exclusive request.
    pub(crate) fn undo_upgradable(&mut self, owner: &Arc<OwnerHandle>, undo: UpgradableUndo) {
        match undo {
            UpgradableUndo::Keep => {}
            UpgradableUndo::Release => {
                debug_assert!(self.owner_is(owner));
                self.owner = None;
                self.count &= !UPGRADE_FLAG;
            }
            UpgradableUndo::RestoreShared => {
                debug_assert!(self.owner_is(owner));
                self.owner = None;
                self.count = (self.count & !UPGRADE_FLAG) + 1;
                self.shared_owners.push(Arc::clone(owner));
            }
        }
    }

    // -- release ----------------------------------------------------------

    /// Full release of whatever mode `owner` holds.
    pub(crate) fn unlock(&mut self, owner: &Arc<OwnerHandle>) -> Result<(), crate::LockError> {
        if self.owner_is(owner) {
            self.owner = None;
            self.count = if self.count == EXCLUSIVE {
                0
            } else {
                self.count & !UPGRADE_FLAG
            };
        } else if let Some(i) = self.shared_index(owner) {
            self.shared_owners.swap_remove(i);
            self.count -= 1;
        } else {
            return Err(crate::LockError::State("lock not held"));
        }
        self.wake_waiters();
        Ok(())
    }

    /// Demote an upgradable or exclusive hold to a plain shared hold.
    pub(crate) fn unlock_to_shared(&mut self, owner: &Arc<OwnerHandle>) -> Result<(), crate::LockError> {
        if self.owner_is(owner) {
            self.owner = None;
            self.count = if self.count == EXCLUSIVE {
                0
            } else {
                self.count & !UPGRADE_FLAG
            };
            if self.shared_index(owner).is_none() {
                self.shared_owners.push(Arc::clone(owner));
                self.count += 1;
            }
            self.wake_waiters();
            Ok(())
        } else if self.shared_index(owner).is_some() {
            // Already just shared.
            Ok(())
        } else {
            Err(crate::LockError::State("lock not held"))
        }
    }

    /// Demote an exclusive hold to upgradable, re-admitting shared waiters.
    pub(crate) fn unlock_to_upgradable(
        &mut self,
        owner: &Arc<OwnerHandle>,
    ) -> Result<(), crate::LockError> {
        if !self.owner_is(owner) {
            return Err(crate::LockError::State(
                "lock not held as upgradable or exclusive",
            ));
        }
        if self.count == EXCLUSIVE {
            self.count = UPGRADE_FLAG;
            self.wake_waiters();
        }
        Ok(())
    }

    /// Hand an exclusive hold to another owner without touching the queues.
    /// Returns `Some(true)` when transferred now, `Some(false)` when a prior
    /// walk already transferred it, `None` when not exclusively held.
    pub(crate) fn transfer_exclusive(
        &mut self,
        owner: &Arc<OwnerHandle>,
        to: &Arc<OwnerHandle>,
    ) -> Option<bool> {
        if self.count != EXCLUSIVE {
            return None;
        }
        if self.owner_is(owner) {
            self.owner = Some(Arc::clone(to));
            Some(true)
        } else if self.owner_is(to) {
            Some(false)
        } else {
            None
        }
    }

    // -- waiting ----------------------------------------------------------

    /// Remove a cancelled waiter. Returns false when a grant won the race,
    /// in which case the caller holds the lock after all.
    pub(crate) fn cancel_waiter(&mut self, waiter: &Arc<LockWaiter>) -> bool {
        if waiter.is_granted() {
            return false;
        }
        for queue in [&mut self.queue_u, &mut self.queue_sx] {
            if let Some(pos) = queue.iter().position(|w| Arc::ptr_eq(w, waiter)) {
                queue.remove(pos);
                break;
            }
        }
        waiter.state.store(CANCELLED, Ordering::Release);
        true
    }

    /// Grant whatever the current state admits, in priority order: the
    /// queued exclusive conversion when the last shared hold is gone, else
    /// the contiguous shared prefix and the head upgradable aspirant.
    pub(crate) fn wake_waiters(&mut self) {
        let head_exclusive = matches!(
            self.queue_sx.front().map(|w| w.mode),
            Some(WaitMode::Exclusive)
        );
        if head_exclusive {
            let convertible = self.count == UPGRADE_FLAG && {
                let head = self.queue_sx.front().expect("head probed above");
                self.owner_is(&head.owner)
            };
            if convertible {
                self.count = EXCLUSIVE;
                let waiter = self.queue_sx.pop_front().expect("head probed above");
                waiter.grant();
            }
            // Shared waiters behind a parked conversion stay parked.
            return;
        }
        if self.count == EXCLUSIVE {
            return;
        }
        while let Some(head) = self.queue_sx.front() {
            if head.mode != WaitMode::Shared || self.shared_count() >= MAX_SHARED {
                break;
            }
            let waiter = self.queue_sx.pop_front().expect("head probed above");
            self.shared_owners.push(Arc::clone(&waiter.owner));
            self.count += 1;
            waiter.grant();
        }
        if self.owner.is_none() {
            if let Some(waiter) = self.queue_u.pop_front() {
                if waiter.convert_from_shared {
                    self.convert_shared_to_upgradable(&waiter.owner);
                } else {
                    self.owner = Some(Arc::clone(&waiter.owner));
                    self.count |= UPGRADE_FLAG;
                }
                waiter.grant();
            }
        }
    }
}

impl std::fmt::Debug for LockEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.count == EXCLUSIVE {
            "exclusive"
        } else if self.count & UPGRADE_FLAG != 0 {
            "upgradable"
        } else if self.count > 0 {
            "shared"
        } else {
            "unheld"
        };
        f.debug_struct("LockEntry")
            .field("index_id", &self.index_id)
            .field("mode", &mode)
            .field("shared", &self.shared_count())
            .field("queued_u", &self.queue_u.len())
            .field("queued_sx", &self.queue_sx.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LockEntry {
        let key: Arc<[u8]> = Arc::from(&b"key"[..]);
        LockEntry::new(1, key, 0x1234)
    }

    fn step_result(step: &AcquireStep) -> LockResult {
        match step {
            AcquireStep::Done { result, .. } => *result,
            AcquireStep::Wait { .. } => panic!("unexpected wait"),
            AcquireStep::Fail(msg) => panic!("unexpected fail: {msg}"),
        }
    }

    #[test]
    fn shared_then_shared_is_owned() {
        let mut entry = entry();
        let owner = OwnerHandle::new();
        assert_eq!(step_result(&entry.try_shared(&owner)), LockResult::Acquired);
        assert_eq!(
            step_result(&entry.try_shared(&owner)),
            LockResult::OwnedShared
        );
        entry.unlock(&owner).unwrap();
        assert!(entry.is_dead());
    }

    #[test]
    fn upgradable_allows_shared() {
        let mut entry = entry();
        let a = OwnerHandle::new();
        let b = OwnerHandle::new();
        assert_eq!(
            step_result(&entry.try_upgradable(&a, UpgradeRule::Strict)),
            LockResult::Acquired
        );
        assert_eq!(step_result(&entry.try_shared(&b)), LockResult::Acquired);
        assert_eq!(entry.check(&a), LockResult::OwnedUpgradable);
        assert_eq!(entry.check(&b), LockResult::OwnedShared);
    }

    #[test]
    fn second_upgradable_waits() {
        let mut entry = entry();
        let a = OwnerHandle::new();
        let b = OwnerHandle::new();
        assert_eq!(
            step_result(&entry.try_upgradable(&a, UpgradeRule::Strict)),
            LockResult::Acquired
        );
        assert!(matches!(
            entry.try_upgradable(&b, UpgradeRule::Strict),
            AcquireStep::Wait { .. }
        ));
        // Releasing the owner hands the mode to the queued aspirant.
        entry.unlock(&a).unwrap();
        assert_eq!(entry.check(&b), LockResult::OwnedUpgradable);
    }

    #[test]
    fn strict_rule_rejects_shared_promotion() {
        let mut entry = entry();
        let owner = OwnerHandle::new();
        assert_eq!(step_result(&entry.try_shared(&owner)), LockResult::Acquired);
        assert_eq!(
            step_result(&entry.try_upgradable(&owner, UpgradeRule::Strict)),
            LockResult::Illegal
        );
    }

    #[test]
    fn lenient_rule_converts_sole_shared() {
        let mut entry = entry();
        let owner = OwnerHandle::new();
        assert_eq!(step_result(&entry.try_shared(&owner)), LockResult::Acquired);
        let step = entry.try_upgradable(&owner, UpgradeRule::Lenient);
        match step {
            AcquireStep::Done { result, push } => {
                assert_eq!(result, LockResult::Acquired);
                assert_eq!(push, Some(true), "promotion must set the upgrade bit");
            }
            _ => panic!("expected immediate conversion"),
        }
        // The shared hold was folded into the upgradable one.
        assert_eq!(entry.check(&owner), LockResult::OwnedUpgradable);
        assert!(entry.try_convert_exclusive(&owner));
    }

    #[test]
    fn lenient_rule_rejects_with_other_readers() {
        let mut entry = entry();
        let a = OwnerHandle::new();
        let b = OwnerHandle::new();
        assert_eq!(step_result(&entry.try_shared(&a)), LockResult::Acquired);
        assert_eq!(step_result(&entry.try_shared(&b)), LockResult::Acquired);
        assert_eq!(
            step_result(&entry.try_upgradable(&a, UpgradeRule::Lenient)),
            LockResult::Illegal
        );
    }

    #[test]
    fn exclusive_conversion_waits_for_readers() {
        let mut entry = entry();
        let writer = OwnerHandle::new();
        let reader = OwnerHandle::new();
        assert_eq!(step_result(&entry.try_shared(&reader)), LockResult::Acquired);
        assert_eq!(
            step_result(&entry.try_upgradable(&writer, UpgradeRule::Strict)),
            LockResult::Acquired
        );
        assert!(!entry.try_convert_exclusive(&writer));
        let waiter = entry.enqueue_exclusive(&writer, LockResult::Acquired, false);
        // New shared requests must queue behind the conversion.
        let late = OwnerHandle::new();
        assert!(matches!(entry.try_shared(&late), AcquireStep::Wait { .. }));
        // The last reader leaving grants the conversion.
        entry.unlock(&reader).unwrap();
        assert!(waiter.is_granted());
        assert_eq!(entry.check(&writer), LockResult::OwnedExclusive);
    }

    #[test]
    fn release_grants_fifo_shared_prefix() {
        let mut entry = entry();
        let writer = OwnerHandle::new();
        assert_eq!(
            step_result(&entry.try_upgradable(&writer, UpgradeRule::Strict)),
            LockResult::Acquired
        );
        assert!(entry.try_convert_exclusive(&writer));

        let readers: Vec<_> = (0..3).map(|_| OwnerHandle::new()).collect();
        let waiters: Vec<_> = readers
            .iter()
            .map(|r| match entry.try_shared(r) {
                AcquireStep::Wait { waiter } => waiter,
                _ => panic!("reader must queue behind exclusive"),
            })
            .collect();

        entry.unlock(&writer).unwrap();
        for (reader, waiter) in readers.iter().zip(&waiters) {
            assert!(waiter.is_granted());
            assert_eq!(entry.check(reader), LockResult::OwnedShared);
        }
    }

    #[test]
    fn demote_exclusive_readmits_shared() {
        let mut entry = entry();
        let writer = OwnerHandle::new();
        let reader = OwnerHandle::new();
        assert_eq!(
            step_result(&entry.try_upgradable(&writer, UpgradeRule::Strict)),
            LockResult::Acquired
        );
        assert!(entry.try_convert_exclusive(&writer));
        let waiter = match entry.try_shared(&reader) {
            AcquireStep::Wait { waiter } => waiter,
            _ => panic!("reader must queue"),
        };
        entry.unlock_to_upgradable(&writer).unwrap();
        assert!(waiter.is_granted());
        assert_eq!(entry.check(&reader), LockResult::OwnedShared);
        assert_eq!(entry.check(&writer), LockResult::OwnedUpgradable);
    }

    #[test]
    fn transfer_moves_ownership_once() {
        let mut entry = entry();
        let from = OwnerHandle::new();
        let to = OwnerHandle::new();
        assert_eq!(
            step_result(&entry.try_upgradable(&from, UpgradeRule::Strict)),
            LockResult::Acquired
        );
        assert!(entry.try_convert_exclusive(&from));
        assert_eq!(entry.transfer_exclusive(&from, &to), Some(true));
        assert_eq!(entry.transfer_exclusive(&from, &to), Some(false));
        assert_eq!(entry.check(&to), LockResult::OwnedExclusive);
    }
}
