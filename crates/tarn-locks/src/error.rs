//! Lock failure taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::deadlock::DeadlockSet;

/// A failed lock operation.
///
/// Timeouts and deadlocks carry the wait bound that expired (`None` meaning
/// the caller asked for an unbounded wait, which cannot time out but can
/// still be diagnosed as deadlocked by another participant).
#[derive(Error, Debug)]
pub enum LockError {
    /// The wait expired without the lock becoming available.
    #[error("lock request timed out after {timeout:?}")]
    Timeout { timeout: Option<Duration> },

    /// The wait expired and a cycle through this locker was proven.
    #[error("deadlock detected after {timeout:?}; locker {guilty} chosen as victim")]
    Deadlock {
        timeout: Option<Duration>,
        /// Id of the locker the detector blames (the one that timed out).
        guilty: u64,
        set: DeadlockSet,
    },

    /// Shared-to-upgradable promotion forbidden by the configured rule.
    #[error("cannot upgrade a shared lock")]
    IllegalUpgrade,

    /// The waiting thread was interrupted.
    #[error("lock request interrupted")]
    Interrupted,

    /// The locker was asked to do something its stack state forbids.
    #[error("illegal locker state: {0}")]
    State(&'static str),

    /// Generic failure (closed or mismatched manager, for instance).
    #[error("lock operation failed: {0}")]
    Failure(&'static str),
}
