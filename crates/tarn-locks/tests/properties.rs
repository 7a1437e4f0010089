//! Property laws for lock round trips and scope restoration.

use std::sync::Arc;
use std::time::Duration;

use proptest::collection::vec;
use proptest::prelude::*;
use tarn_locks::{LockManager, LockResult, Locker};

fn keys() -> impl Strategy<Value = Vec<Vec<u8>>> {
    vec(vec(any::<u8>(), 1..16), 1..16)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// `lock_shared; unlock` leaves every key exactly as it was: free.
    #[test]
    fn shared_lock_unlock_is_identity(keys in keys()) {
        let manager = Arc::new(LockManager::new());
        let mut txn = Locker::new(Arc::clone(&manager));
        for key in &keys {
            prop_assert!(txn.lock_shared(5, key, None).unwrap().is_held());
        }
        txn.scope_exit_all();

        let mut probe = Locker::new(manager);
        for key in &keys {
            let result = probe
                .lock_exclusive(5, key, Some(Duration::ZERO))
                .unwrap();
            prop_assert!(
                matches!(result, LockResult::Acquired | LockResult::OwnedExclusive),
                "key left locked: {result:?}"
            );
        }
    }

    /// `upgradable; exclusive; demote; unlock` is equivalent to
    /// `upgradable; unlock`.
    #[test]
    fn upgrade_demote_round_trip(key in vec(any::<u8>(), 1..32)) {
        let manager = Arc::new(LockManager::new());

        let mut a = Locker::new(Arc::clone(&manager));
        a.lock_upgradable(5, &key, None).unwrap();
        prop_assert_eq!(
            a.lock_exclusive(5, &key, None).unwrap(),
            LockResult::Upgraded
        );
        a.unlock_to_upgradable().unwrap();
        prop_assert_eq!(a.lock_check(5, &key), LockResult::OwnedUpgradable);
        a.unlock().unwrap();
        prop_assert_eq!(a.lock_check(5, &key), LockResult::Unowned);

        let mut b = Locker::new(manager);
        prop_assert_eq!(
            b.lock_exclusive(5, &key, Some(Duration::ZERO)).unwrap(),
            LockResult::Acquired
        );
    }

    /// After a scope exit, the held set equals the set at scope entry.
    #[test]
    fn scope_exit_restores_outer_locks(
        outer in keys(),
        inner in keys(),
    ) {
        let manager = Arc::new(LockManager::new());
        let mut txn = Locker::new(Arc::clone(&manager));
        for key in &outer {
            txn.lock_shared(1, key, None).unwrap();
        }
        txn.scope_enter();
        for key in &inner {
            txn.lock_exclusive(2, key, None).unwrap();
        }
        txn.scope_exit();

        for key in &outer {
            prop_assert_eq!(txn.lock_check(1, key), LockResult::OwnedShared);
        }
        for key in &inner {
            prop_assert_eq!(txn.lock_check(2, key), LockResult::Unowned);
        }
    }
}
