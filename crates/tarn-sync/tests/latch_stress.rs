//! Cross-thread stress for the latch and the commit gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tarn_sync::{CommitLatch, Latch, RawLatch};

/// Mutual exclusion: concurrent unguarded increments through the exclusive
/// latch must not lose updates.
#[test]
fn exclusive_counter_stress() {
    const THREADS: usize = 8;
    const ROUNDS: u64 = 5_000;

    let latch = Arc::new(RawLatch::new());
    let counter = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let latch = Arc::clone(&latch);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    latch.acquire_exclusive();
                    // Unsynchronized read-modify-write; the latch is the only
                    // thing making this correct.
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    latch.release_exclusive();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), THREADS as u64 * ROUNDS);
}

/// Readers and writers over guarded data: every reader must observe a
/// consistent pair, never a torn write.
#[test]
fn guarded_readers_and_writers() {
    const WRITERS: usize = 2;
    const READERS: usize = 6;
    const ROUNDS: usize = 2_000;

    let cell: Arc<Latch<(u64, u64)>> = Arc::new(Latch::new((0, 0)));

    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let cell = Arc::clone(&cell);
        handles.push(thread::spawn(move || {
            for round in 0..ROUNDS {
                let mut guard = cell.write();
                guard.0 = round as u64;
                guard.1 = round as u64;
            }
        }));
    }
    for _ in 0..READERS {
        let cell = Arc::clone(&cell);
        handles.push(thread::spawn(move || {
            for _ in 0..ROUNDS {
                let guard = cell.read();
                assert_eq!(guard.0, guard.1, "torn write observed");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Timed exclusive requests against a long-lived reader expire without
/// corrupting the state word for later acquirers.
#[test]
fn timed_exclusive_expiry_stress() {
    let latch = Arc::new(RawLatch::new());
    latch.acquire_shared();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.try_acquire_exclusive_for(Duration::from_millis(10)))
        })
        .collect();
    for handle in handles {
        assert!(!handle.join().unwrap());
    }

    latch.release_shared();
    assert!(latch.try_acquire_exclusive());
    latch.release_exclusive();
    assert!(latch.try_acquire_shared());
    latch.release_shared();
}

/// Commit gate under reader fire: 8 threads cycling shared holds while one
/// takes the gate exclusively. Counters must balance and the exclusive
/// acquirer must get through.
#[test]
fn commit_gate_stress() {
    const READERS: usize = 8;
    const ROUNDS: usize = 1_000;

    let gate = Arc::new(CommitLatch::new());

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    gate.acquire_shared();
                    gate.release_shared();
                }
            })
        })
        .collect();

    let exclusive = {
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
    assert!(exclusive.join().unwrap(), "exclusive acquirer saw readers");
    assert_eq!(gate.acquire_sum(), gate.release_sum());
    assert!(!gate.has_shared_lockers());
}
