//! Transactional key-range lock manager for the Tarn storage engine.
//!
//! Locks are identified by `(index_id, key)` pairs and come in three modes
//! forming a compatibility lattice: **shared** coexists with shared and
//! upgradable, **upgradable** coexists only with shared, **exclusive** with
//! nothing. Records live in a sharded table ([`LockManager`]); transactions
//! hold them through a scoped stack ([`Locker`]) that releases on commit,
//! rollback, or scope exit, with per-lock FIFO waiting, timeouts,
//! interruption, and deadlock diagnosis on top.
//!
//! ```
//! use tarn_locks::{LockManager, Locker, LockResult};
//! use std::sync::Arc;
//!
//! let manager = Arc::new(LockManager::new());
//! let mut txn = Locker::new(Arc::clone(&manager));
//! let result = txn.lock_exclusive(1, b"key", None).unwrap();
//! assert_eq!(result, LockResult::Acquired);
//! txn.scope_exit_all();
//! assert_eq!(txn.lock_check(1, b"key"), LockResult::Unowned);
//! ```

mod deadlock;
mod entry;
mod error;
mod key;
mod locker;
mod manager;
mod metrics;
mod owner;
mod pending;
mod result;

pub use deadlock::{DeadlockEntry, DeadlockSet};
pub use error::LockError;
pub use key::{key_hash, LockRef};
pub use locker::Locker;
pub use manager::{LockManager, LockManagerOptions};
pub use metrics::{lock_metrics, reset_lock_metrics, LockMetrics};
pub use owner::InterruptHandle;
pub use pending::PendingTxn;
pub use result::{LockResult, UpgradeRule};
