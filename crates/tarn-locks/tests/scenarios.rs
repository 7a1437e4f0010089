//! End-to-end lock manager scenarios across threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use tarn_locks::{LockError, LockManager, LockManagerOptions, LockResult, Locker, UpgradeRule};
use tarn_sync::CommitLatch;

fn manager() -> Arc<LockManager> {
    Arc::new(LockManager::new())
}

/// A shared holder forces a timed exclusive request to expire, leaving the
/// holder untouched.
#[test]
fn exclusive_times_out_against_shared_holder() {
    let manager = manager();
    let mut t1 = Locker::new(Arc::clone(&manager));
    t1.lock_shared(1, b"k", None).unwrap();

    let contender = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let mut t2 = Locker::new(manager);
            let start = Instant::now();
            let error = t2
                .lock_exclusive(1, b"k", Some(Duration::from_millis(10)))
                .unwrap_err();
            (error, start.elapsed())
        })
    };

    let (error, elapsed) = contender.join().unwrap();
    assert!(matches!(error, LockError::Timeout { .. }), "got {error}");
    assert!(elapsed >= Duration::from_millis(10));

    // The reader was unaffected, including by the aborted request's
    // transient upgradable hold.
    assert_eq!(t1.lock_check(1, b"k"), LockResult::OwnedShared);
    t1.unlock().unwrap();
    let mut t3 = Locker::new(manager);
    assert_eq!(t3.lock_exclusive(1, b"k", None).unwrap(), LockResult::Acquired);
}

/// Upgradable does not block shared.
#[test]
fn upgradable_admits_shared() {
    let manager = manager();
    let mut t1 = Locker::new(Arc::clone(&manager));
    let mut t2 = Locker::new(Arc::clone(&manager));
    t1.lock_upgradable(1, b"k", None).unwrap();
    assert_eq!(
        t2.try_lock_shared(1, b"k", Some(Duration::ZERO)).unwrap(),
        LockResult::Acquired
    );
}

/// A waiting exclusive request gates new shared requests on that key, and
/// the drain order is exclusive first, queued shared after.
#[test]
fn exclusive_wait_blocks_new_shared() {
    let manager = manager();
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut t1 = Locker::new(Arc::clone(&manager));
    t1.lock_shared(1, b"k", None).unwrap();

    let t2 = {
        let manager = Arc::clone(&manager);
        let events = Arc::clone(&events);
        thread::spawn(move || {
            let mut t2 = Locker::new(manager);
            t2.lock_exclusive(1, b"k", None).unwrap();
            events.lock().unwrap().push("t2-acquired");
            thread::sleep(Duration::from_millis(20));
            t2.scope_exit_all();
        })
    };

    // Let the exclusive request park in conversion.
    thread::sleep(Duration::from_millis(50));

    let t3 = {
        let manager = Arc::clone(&manager);
        let events = Arc::clone(&events);
        thread::spawn(move || {
            let mut t3 = Locker::new(manager);
            t3.lock_shared(1, b"k", None).unwrap();
            events.lock().unwrap().push("t3-acquired");
            t3.scope_exit_all();
        })
    };

    // The queued exclusive must gate t3 even though only a shared hold is
    // active right now.
    thread::sleep(Duration::from_millis(50));
    assert!(events.lock().unwrap().is_empty(), "t3 barged past a queued exclusive");

    t1.unlock().unwrap();
    t2.join().unwrap();
    t3.join().unwrap();
    assert_eq!(*events.lock().unwrap(), vec!["t2-acquired", "t3-acquired"]);
}

/// Classic two-locker deadlock: the shorter timeout becomes the victim and
/// reports the cycle; the survivor proceeds once the victim rolls back.
#[test]
fn deadlock_is_detected_and_one_proceeds() {
    let manager = manager();
    let barrier = Arc::new(Barrier::new(2));

    let victim = {
        let manager = Arc::clone(&manager);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut t1 = Locker::new(manager);
            t1.lock_shared(1, b"a", None).unwrap();
            barrier.wait();
            let error = t1
                .lock_exclusive(1, b"b", Some(Duration::from_millis(300)))
                .unwrap_err();
            // Roll back so the survivor can finish.
            t1.scope_exit_all();
            error
        })
    };

    let survivor = {
        let manager = Arc::clone(&manager);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut t2 = Locker::new(manager);
            t2.lock_shared(1, b"b", None).unwrap();
            barrier.wait();
            let result = t2.lock_exclusive(1, b"a", Some(Duration::from_secs(10)));
            t2.scope_exit_all();
            result
        })
    };

    let error = victim.join().unwrap();
    match &error {
        LockError::Deadlock { guilty, set, .. } => {
            assert!(set.len() >= 2, "cycle should name both participants: {set}");
            assert!(*guilty > 0);
        }
        other => panic!("expected deadlock, got {other}"),
    }
    assert!(survivor.join().unwrap().unwrap().is_held());
}

/// Grants on one key preserve enqueue order among exclusive requesters.
#[test]
fn exclusive_grants_are_fifo() {
    let manager = manager();
    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    let mut holder = Locker::new(Arc::clone(&manager));
    holder.lock_exclusive(1, b"k", None).unwrap();

    let mut contenders = Vec::new();
    for i in 0..4 {
        let manager = Arc::clone(&manager);
        let order = Arc::clone(&order);
        contenders.push(thread::spawn(move || {
            let mut txn = Locker::new(manager);
            txn.lock_exclusive(1, b"k", None).unwrap();
            order.lock().unwrap().push(i);
            txn.scope_exit_all();
        }));
        // Stagger spawns so enqueue order is deterministic.
        thread::sleep(Duration::from_millis(100));
    }

    holder.scope_exit_all();
    for contender in contenders {
        contender.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

/// Exclusive holds exclude each other: unsynchronized read-modify-write per
/// key stays consistent when guarded by the lock manager.
#[test]
fn exclusive_locks_serialize_writers() {
    const THREADS: usize = 8;
    const KEYS: usize = 16;
    const ROUNDS: usize = 200;

    let manager = manager();
    let counters: Arc<Vec<AtomicU64>> =
        Arc::new((0..KEYS).map(|_| AtomicU64::new(0)).collect());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let manager = Arc::clone(&manager);
            let counters = Arc::clone(&counters);
            thread::spawn(move || {
                let mut txn = Locker::new(manager);
                for round in 0..ROUNDS {
                    let key_index = (t + round * 7) % KEYS;
                    let key = (key_index as u32).to_be_bytes();
                    txn.lock_exclusive(9, &key, None).unwrap();
                    let counter = &counters[key_index];
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    txn.unlock().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert_eq!(total, (THREADS * ROUNDS) as u64);
}

/// Interrupting a parked wait surfaces as an `Interrupted` failure and
/// leaves the lock with its holder.
#[test]
fn interrupt_aborts_a_wait() {
    let manager = manager();
    let mut holder = Locker::new(Arc::clone(&manager));
    holder.lock_exclusive(1, b"k", None).unwrap();

    let (handle_tx, handle_rx) = std::sync::mpsc::channel();
    let waiter = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let mut txn = Locker::new(manager);
            handle_tx.send(txn.interrupt_handle()).unwrap();
            txn.lock_shared(1, b"k", None).unwrap_err()
        })
    };

    let interrupt = handle_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    interrupt.interrupt();
    let error = waiter.join().unwrap();
    assert!(matches!(error, LockError::Interrupted), "got {error}");
    assert_eq!(holder.lock_check(1, b"k"), LockResult::OwnedExclusive);
}

/// Readers hammer random keys through the commit gate while one thread
/// takes it exclusively; the split counters must balance afterwards.
#[test]
fn commit_gate_with_lock_traffic() {
    const READERS: usize = 8;
    const KEYS_PER_READER: usize = 1000;

    let manager = manager();
    let gate = Arc::new(CommitLatch::new());

    let readers: Vec<_> = (0..READERS)
        .map(|t| {
            let manager = Arc::clone(&manager);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let mut txn = Locker::new(manager);
                let mut rng = rand::rngs::StdRng::seed_from_u64(t as u64);
                for _ in 0..KEYS_PER_READER {
                    let key = rng.gen::<u64>().to_be_bytes();
                    gate.acquire_shared();
                    txn.lock_shared(3, &key, None).unwrap();
                    txn.scope_exit_all();
                    gate.release_shared();
                }
            })
        })
        .collect();

    let checkpointer = {
        let gate = Arc::clone(&gate);
        thread::spawn(move || {
            gate.acquire_exclusive();
            let quiescent = !gate.has_shared_lockers();
            gate.release_exclusive();
            quiescent
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    assert!(checkpointer.join().unwrap());
    assert_eq!(gate.acquire_sum(), gate.release_sum());
}

/// A strict-rule manager rejects shared-to-upgradable; lenient permits the
/// sole reader; unchecked always permits.
#[test]
fn upgrade_rules() {
    let cases = [
        (UpgradeRule::Strict, false),
        (UpgradeRule::Lenient, true),
        (UpgradeRule::Unchecked, true),
    ];
    for (rule, sole_reader_allowed) in cases {
        let manager = Arc::new(LockManager::with_options(LockManagerOptions {
            upgrade_rule: rule,
            ..LockManagerOptions::default()
        }));
        let mut txn = Locker::new(Arc::clone(&manager));
        txn.lock_shared(1, b"k", None).unwrap();
        let outcome = txn.lock_upgradable(1, b"k", None);
        if sole_reader_allowed {
            assert_eq!(outcome.unwrap(), LockResult::Acquired, "rule {rule:?}");
        } else {
            assert!(
                matches!(outcome, Err(LockError::IllegalUpgrade)),
                "rule {rule:?}"
            );
        }
    }

    // Lenient refuses when another reader is present; unchecked does not.
    let mut results = HashMap::new();
    for rule in [UpgradeRule::Lenient, UpgradeRule::Unchecked] {
        let manager = Arc::new(LockManager::with_options(LockManagerOptions {
            upgrade_rule: rule,
            ..LockManagerOptions::default()
        }));
        let mut a = Locker::new(Arc::clone(&manager));
        let mut b = Locker::new(Arc::clone(&manager));
        a.lock_shared(1, b"k", None).unwrap();
        b.lock_shared(1, b"k", None).unwrap();
        results.insert(
            format!("{rule:?}"),
            a.lock_upgradable(1, b"k", Some(Duration::from_millis(10)))
                .map(|r| r.is_held())
                .unwrap_or(false),
        );
        a.scope_exit_all();
        b.scope_exit_all();
    }
    assert_eq!(results["Lenient"], false);
    assert_eq!(results["Unchecked"], true);
}
