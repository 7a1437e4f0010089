//! Synchronization primitives for the Tarn storage engine.
//!
//! Everything in the engine that parks a thread goes through this crate:
//!
//! - [`RawLatch`] / [`Latch`]: the multi-mode reader/writer gate guarding
//!   lock shards, page state, and file mappings. Tuned for very high reader
//!   concurrency with fair handoff under contention.
//! - [`CommitLatch`]: a reader-majority gate coordinating bulk checkpoint
//!   work against all other writers.
//! - [`StripedCounter`]: the split counter backing the commit gate.

pub mod cache_aligned;
pub mod commit;
pub mod latch;
pub mod striped;

pub use cache_aligned::{CacheAligned, CACHE_LINE_BYTES};
pub use commit::CommitLatch;
pub use latch::{Latch, LatchReadGuard, LatchWriteGuard, RawLatch};
pub use striped::StripedCounter;
