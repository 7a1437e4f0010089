//! Wait-for graph diagnosis.
//!
//! Runs only after a lock wait times out, while the timed-out locker's
//! `waiting_for` is still published. The scan is transient: no edges are
//! cached, at most one shard latch is held at a time, and every latch is
//! taken with `try`; an unavailable shard ends that branch with "no cycle"
//! rather than blocking a thread that is already reporting a failure.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::manager::LockManager;
use crate::owner::OwnerHandle;

/// Traversal bound; cycles in practice involve a handful of lockers.
const MAX_DEPTH: usize = 64;

/// One locker's position in a diagnosed deadlock.
#[derive(Debug, Clone)]
pub struct DeadlockEntry {
    /// Id of the waiting locker.
    pub owner_id: u64,
    /// Index containing the contended key.
    pub index_id: u64,
    /// The contended key.
    pub key: Box<[u8]>,
}

/// The participants of a diagnosed deadlock cycle.
#[derive(Debug, Clone, Default)]
pub struct DeadlockSet {
    pub entries: Vec<DeadlockEntry>,
}

impl DeadlockSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for DeadlockSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "locker {} waiting on index {} key ",
                entry.owner_id, entry.index_id
            )?;
            for byte in entry.key.iter() {
                write!(f, "{byte:02x}")?;
            }
        }
        write!(f, "]")
    }
}

struct Scan<'a> {
    manager: &'a LockManager,
    origin: u64,
    visited: HashSet<u64>,
    entries: Vec<DeadlockEntry>,
}

impl Scan<'_> {
    fn visit(&mut self, owner: &Arc<OwnerHandle>, depth: usize) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        let Some(waiting_for) = owner.waiting_for() else {
            return false;
        };
        self.entries.push(DeadlockEntry {
            owner_id: owner.id(),
            index_id: waiting_for.index_id(),
            key: Box::from(waiting_for.key()),
        });
        let Some(holders) = self.manager.try_holders_of(&waiting_for, owner.id()) else {
            // Shard latch unavailable; cannot prove anything down this edge.
            self.entries.pop();
            return false;
        };
        for holder in &holders {
            if holder.id() == self.origin {
                return true;
            }
            if self.visited.insert(holder.id()) && self.visit(holder, depth + 1) {
                return true;
            }
        }
        self.entries.pop();
        false
    }
}

/// Search for a cycle through `origin`'s published wait. Returns the
/// participant set when one is proven.
pub(crate) fn detect(manager: &LockManager, origin: &Arc<OwnerHandle>) -> Option<DeadlockSet> {
    let mut scan = Scan {
        manager,
        origin: origin.id(),
        visited: HashSet::new(),
        entries: Vec::new(),
    };
    scan.visited.insert(origin.id());
    if scan.visit(origin, 0) {
        let set = DeadlockSet {
            entries: scan.entries,
        };
        warn!(origin = origin.id(), participants = set.len(), "deadlock detected");
        Some(set)
    } else {
        None
    }
}
