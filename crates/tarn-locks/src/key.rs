//! Lock identity: `(index_id, key)` pairs and their 32-bit hash.

use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Hash an `(index_id, key)` pair to the 32-bit code that drives shard
/// selection. The index id seeds the hash so equal keys in different indexes
/// land on different shards.
#[must_use]
pub fn key_hash(index_id: u64, key: &[u8]) -> u32 {
    let wide = xxh3_64_with_seed(key, index_id);
    (wide ^ (wide >> 32)) as u32
}

/// Handle to a lock a locker holds or waits on.
///
/// The key buffer is shared with the shard's lock record, so clones are two
/// pointer copies; equality of identity is pointer equality on the buffer
/// plus the index id.
#[derive(Clone)]
pub struct LockRef {
    pub(crate) index_id: u64,
    pub(crate) key: Arc<[u8]>,
    pub(crate) hash: u32,
}

impl LockRef {
    #[must_use]
    pub fn index_id(&self) -> u64 {
        self.index_id
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// True when both refs name the same live lock record.
    pub(crate) fn same_lock(&self, other: &LockRef) -> bool {
        self.index_id == other.index_id && Arc::ptr_eq(&self.key, &other.key)
    }
}

impl std::fmt::Debug for LockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRef")
            .field("index_id", &self.index_id)
            .field("key_len", &self.key.len())
            .field("hash", &format_args!("{:#010x}", self.hash))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_seeded() {
        let a = key_hash(1, b"apple");
        assert_eq!(a, key_hash(1, b"apple"));
        assert_ne!(a, key_hash(2, b"apple"), "index id must perturb the hash");
        assert_ne!(a, key_hash(1, b"apples"));
    }

    #[test]
    fn same_lock_is_buffer_identity() {
        let key: Arc<[u8]> = Arc::from(&b"k"[..]);
        let a = LockRef {
            index_id: 1,
            key: Arc::clone(&key),
            hash: key_hash(1, b"k"),
        };
        let b = a.clone();
        assert!(a.same_lock(&b));

        let other = LockRef {
            index_id: 1,
            key: Arc::from(&b"k"[..]),
            hash: key_hash(1, b"k"),
        };
        assert!(!a.same_lock(&other), "equal bytes, different record");
    }
}
