//! Memory-mapped file access in fixed chunks.
//!
//! ## Latching
//!
//! Three gates coordinate access, mirroring how the rest of the engine uses
//! the `tarn-sync` primitives:
//!
//! - the **remap latch** serializes structural changes (length changes,
//!   remapping);
//! - the **access gate** guards observation of the mapping table: reads take
//!   it shared, writes and remaps exclusively;
//! - the **sync latch** covers flushes, with a published start instant so
//!   concurrent accesses can stall briefly once a sync runs long.
//!
//! Shrinking the file unmaps first: on Linux a mapping past the new end of
//! file turns later accesses into a process-killing fault, and Windows would
//! silently refuse the truncation.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use tarn_sync::Latch;

/// Chunks of 2³⁰ bytes by default.
pub const DEFAULT_CHUNK_SHIFT: u32 = 30;

/// A sync running longer than this starts throttling access.
const SYNC_YIELD_THRESHOLD: Duration = Duration::from_secs(10);

/// Longest single stall imposed on an access while a sync drags on.
const SYNC_YIELD_MAX: Duration = Duration::from_millis(100);

/// Failures from the mapped-file layer.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file '{path}' is read-only")]
    ReadOnly { path: PathBuf },
}

/// Construction options for [`MappedFile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedFileOptions {
    pub read_only: bool,
    /// log2 of the chunk size. The default maps gigabyte chunks; tests use
    /// small shifts to exercise chunk boundaries cheaply.
    pub chunk_shift: u32,
}

impl Default for MappedFileOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            chunk_shift: DEFAULT_CHUNK_SHIFT,
        }
    }
}

enum Chunk {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Chunk {
    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Ro(map) => map,
            Chunk::Rw(map) => map,
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Chunk::Ro(_) => None,
            Chunk::Rw(map) => Some(map),
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Chunk::Ro(_) => Ok(()),
            Chunk::Rw(map) => map.flush(),
        }
    }
}

struct MappingState {
    chunks: Vec<Chunk>,
    mapped_len: u64,
}

/// A file accessed through chunked memory mappings, falling back to
/// positional I/O past the mapped range.
pub struct MappedFile {
    file: File,
    path: PathBuf,
    read_only: bool,
    chunk_shift: u32,
    /// Serializes set_len/remap against each other.
    remap_latch: Latch<()>,
    /// Guards the mapping table. `None` while unmapped.
    access: Latch<Option<MappingState>>,
    sync_latch: Latch<()>,
    sync_started: Mutex<Option<Instant>>,
}

impl MappedFile {
    /// Open `path` and map its current contents.
    pub fn open(path: &Path, options: MappedFileOptions) -> Result<Self, IoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .create(!options.read_only)
            .open(path)?;
        let mapped = Self {
            file,
            path: path.to_path_buf(),
            read_only: options.read_only,
            chunk_shift: options.chunk_shift,
            remap_latch: Latch::new(()),
            access: Latch::new(None),
            sync_latch: Latch::new(()),
            sync_started: Mutex::new(None),
        };
        mapped.remap()?;
        Ok(mapped)
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length.
    pub fn len(&self) -> Result<u64, IoError> {
        let _access = self.access.read();
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, IoError> {
        Ok(self.len()? == 0)
    }

    /// Change the file length. Shrinking unmaps first and remaps after.
    pub fn set_len(&self, len: u64) -> Result<(), IoError> {
        if self.read_only {
            return Err(IoError::ReadOnly {
                path: self.path.clone(),
            });
        }
        let _remap = self.remap_latch.write();

        let prev = self.file.metadata()?.len();
        let unmap_first = len < prev && self.access.read().is_some();
        if unmap_first {
            *self.access.write() = None;
        }
        let result = self.file.set_len(len);
        if unmap_first || len > prev {
            self.map_current()?;
        }
        result?;
        debug!(path = %self.path.display(), len, prev, "file length changed");
        Ok(())
    }

    /// Drop and rebuild the mapping to cover the current file length.
    pub fn remap(&self) -> Result<(), IoError> {
        let _remap = self.remap_latch.write();
        self.map_current()
    }

    fn map_current(&self) -> Result<(), IoError> {
        let len = self.file.metadata()?.len();
        let chunk_size = 1_u64 << self.chunk_shift;
        let mut chunks = Vec::new();
        let mut offset = 0_u64;
        while offset < len {
            let size = (len - offset).min(chunk_size) as usize;
            // SAFETY: the mapping covers a range inside the file, and every
            // resize of the file goes through the remap latch held here.
            let chunk = if self.read_only {
                let map = unsafe { MmapOptions::new().offset(offset).len(size).map(&self.file)? };
                Chunk::Ro(map)
            } else {
                let map = unsafe {
                    MmapOptions::new()
                        .offset(offset)
                        .len(size)
                        .map_mut(&self.file)?
                };
                Chunk::Rw(map)
            };
            chunks.push(chunk);
            offset += size as u64;
        }
        trace!(
            path = %self.path.display(),
            chunks = chunks.len(),
            mapped_len = len,
            "mapping rebuilt"
        );
        *self.access.write() = Some(MappingState {
            chunks,
            mapped_len: len,
        });
        Ok(())
    }

    /// Read `buf.len()` bytes at `pos`, through the mapping where covered.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.sync_wait();
        let access = self.access.read();
        let copied = match access.as_ref() {
            Some(state) => self.copy_from_mapping(state, pos, buf),
            None => 0,
        };
        if copied < buf.len() {
            self.file
                .read_exact_at(&mut buf[copied..], pos + copied as u64)?;
        }
        Ok(())
    }

    /// Write `buf` at `pos`, through the mapping where covered.
    ///
    /// Takes the access gate exclusively: a shared mapping cannot hand out
    /// aliasing mutable slices.
    pub fn write(&self, pos: u64, buf: &[u8]) -> Result<(), IoError> {
        if self.read_only {
            return Err(IoError::ReadOnly {
                path: self.path.clone(),
            });
        }
        self.sync_wait();
        let mut access = self.access.write();
        let copied = match access.as_mut() {
            Some(state) => self.copy_to_mapping(state, pos, buf),
            None => 0,
        };
        drop(access);
        if copied < buf.len() {
            self.file
                .write_all_at(&buf[copied..], pos + copied as u64)?;
        }
        Ok(())
    }

    fn copy_from_mapping(&self, state: &MappingState, mut pos: u64, buf: &mut [u8]) -> usize {
        let chunk_mask = (1_u64 << self.chunk_shift) - 1;
        let mut copied = 0;
        while copied < buf.len() && pos < state.mapped_len {
            let index = (pos >> self.chunk_shift) as usize;
            let Some(chunk) = state.chunks.get(index) else {
                break;
            };
            let data = chunk.as_slice();
            let offset = (pos & chunk_mask) as usize;
            if offset >= data.len() {
                break;
            }
            let step = (data.len() - offset).min(buf.len() - copied);
            buf[copied..copied + step].copy_from_slice(&data[offset..offset + step]);
            copied += step;
            pos += step as u64;
        }
        copied
    }

    fn copy_to_mapping(&self, state: &mut MappingState, mut pos: u64, buf: &[u8]) -> usize {
        let chunk_mask = (1_u64 << self.chunk_shift) - 1;
        let mut copied = 0;
        while copied < buf.len() && pos < state.mapped_len {
            let index = (pos >> self.chunk_shift) as usize;
            let Some(chunk) = state.chunks.get_mut(index) else {
                break;
            };
            let Some(data) = chunk.as_mut_slice() else {
                break;
            };
            let offset = (pos & chunk_mask) as usize;
            if offset >= data.len() {
                break;
            }
            let step = (data.len() - offset).min(buf.len() - copied);
            data[offset..offset + step].copy_from_slice(&buf[copied..copied + step]);
            copied += step;
            pos += step as u64;
        }
        copied
    }

    /// Flush mapped chunks and the file itself. `metadata` also syncs file
    /// metadata (`fsync` rather than `fdatasync`).
    pub fn sync(&self, metadata: bool) -> Result<(), IoError> {
        let _sync = self.sync_latch.write();
        *self.sync_started.lock() = Some(Instant::now());
        let result = self.sync_inner(metadata);
        *self.sync_started.lock() = None;
        result
    }

    fn sync_inner(&self, metadata: bool) -> Result<(), IoError> {
        {
            let access = self.access.read();
            if let Some(state) = access.as_ref() {
                for chunk in &state.chunks {
                    chunk.flush()?;
                }
            }
        }
        if metadata {
            self.file.sync_all()?;
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Stall briefly when a sync has been running past the threshold, so
    /// bulk flushes are not starved by a firehose of page access.
    fn sync_wait(&self) {
        let Some(started) = *self.sync_started.lock() else {
            return;
        };
        let elapsed = started.elapsed();
        if elapsed > SYNC_YIELD_THRESHOLD {
            thread::sleep((elapsed - SYNC_YIELD_THRESHOLD).min(SYNC_YIELD_MAX));
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("chunk_shift", &self.chunk_shift)
            .finish_non_exhaustive()
    }
}
