//! Cache-line-aware wrapper for contended atomics.
//!
//! Arrays of counters or small locks touched by many threads suffer false
//! sharing when adjacent elements land on the same cache line. Wrapping each
//! element in [`CacheAligned`] pads it out to a whole number of lines.

/// Cache line size in bytes.
///
/// 64 bytes for x86-64 and AArch64. Platforms with 128-byte lines waste a
/// little memory but stay correct.
pub const CACHE_LINE_BYTES: usize = 64;

/// Wraps a value so it starts on a cache-line boundary.
///
/// `#[repr(C, align(64))]` guarantees the struct starts at a 64-byte-aligned
/// address and its size rounds up to a multiple of 64 bytes, so array
/// elements never share a line.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    /// Wrap `value` with cache-line alignment.
    #[inline]
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Unwrap, returning the inner value.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CacheAligned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
