//! Tarn embedded storage engine: the concurrency core.
//!
//! Umbrella crate re-exporting the pieces the rest of the engine consumes:
//!
//! - [`sync`]: latch primitives and the checkpoint commit gate;
//! - [`locks`]: the transactional key-range lock manager;
//! - [`io`]: chunk-mapped file access built on the same latches.

pub use tarn_io as io;
pub use tarn_locks as locks;
pub use tarn_sync as sync;

pub use tarn_locks::{
    LockError, LockManager, LockManagerOptions, LockResult, Locker, PendingTxn, UpgradeRule,
};
pub use tarn_sync::{CommitLatch, Latch, RawLatch};
