//! Chunk-mapped file I/O for the Tarn storage engine.
//!
//! Pages reach disk through a memory-mapped view of the database file,
//! mapped in fixed-size chunks so files larger than a single mapping stay
//! addressable. The interesting part is coordination, built on the latch
//! primitives from `tarn-sync`: a remap latch serializing structural
//! changes, a reader/writer gate over the mapping table, and a sync latch
//! that lets long-running syncs throttle concurrent access.

#[cfg(unix)]
mod mapped;

#[cfg(unix)]
pub use mapped::{IoError, MappedFile, MappedFileOptions, DEFAULT_CHUNK_SHIFT};
