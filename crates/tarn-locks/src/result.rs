//! Lock operation outcomes and upgrade policy.

use serde::{Deserialize, Serialize};

/// Outcome of a lock request or ownership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Lock was acquired fresh; the caller did not hold it before.
    Acquired,
    /// An upgradable hold was promoted to exclusive.
    Upgraded,
    /// Caller already holds the lock shared; no extra unlock is owed.
    OwnedShared,
    /// Caller already holds the lock upgradable.
    OwnedUpgradable,
    /// Caller already holds the lock exclusive.
    OwnedExclusive,
    /// Caller does not hold the lock (check only).
    Unowned,
    /// The request was a shared-to-upgradable promotion forbidden by the
    /// configured [`UpgradeRule`].
    Illegal,
    /// The waiting thread was interrupted.
    Interrupted,
    /// The wait expired.
    TimedOut,
}

impl LockResult {
    /// True when the caller holds the lock after the operation.
    #[must_use]
    pub fn is_held(self) -> bool {
        matches!(
            self,
            Self::Acquired
                | Self::Upgraded
                | Self::OwnedShared
                | Self::OwnedUpgradable
                | Self::OwnedExclusive
        )
    }

    /// True when the lock was already held at the requested strength; no
    /// extra unlock should be performed.
    #[must_use]
    pub fn already_owned(self) -> bool {
        matches!(
            self,
            Self::OwnedShared | Self::OwnedUpgradable | Self::OwnedExclusive
        )
    }

    #[must_use]
    pub fn is_timed_out(self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Policy for promoting a shared hold to upgradable.
///
/// Holding shared while requesting upgradable deadlocks whenever two lockers
/// try it on the same key, so the strict default refuses outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeRule {
    /// Shared-to-upgradable is always illegal.
    #[default]
    Strict,
    /// Permitted when the requester is the only shared holder.
    Lenient,
    /// Always permitted; the caller is responsible for avoiding deadlocks.
    Unchecked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_predicate() {
        assert!(LockResult::Acquired.is_held());
        assert!(LockResult::Upgraded.is_held());
        assert!(LockResult::OwnedShared.is_held());
        assert!(LockResult::OwnedUpgradable.is_held());
        assert!(LockResult::OwnedExclusive.is_held());
        assert!(!LockResult::Unowned.is_held());
        assert!(!LockResult::Illegal.is_held());
        assert!(!LockResult::Interrupted.is_held());
        assert!(!LockResult::TimedOut.is_held());
    }

    #[test]
    fn owned_predicate() {
        assert!(!LockResult::Acquired.already_owned());
        assert!(LockResult::OwnedExclusive.already_owned());
    }
}
