use crate::node::PageRef;
use ahash::RandomState;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Concurrent map from page id to the entry currently caching it.
///
/// Every mutation is conditional on the caller's view of the current mapping,
/// so a stale writer can never clobber an entry published after it looked.
pub trait KeyIndex: Send + Sync {
    fn get(&self, page_id: i64) -> Option<PageRef>;

    /// Insert `entry` unless `page_id` is already mapped.
    ///
    /// Returns the existing mapping when there is one, leaving it untouched.
    fn put_if_absent(&self, page_id: i64, entry: PageRef) -> Option<PageRef>;

    /// Remove the mapping only if it still points at `entry`.
    fn remove_if(&self, page_id: i64, entry: PageRef) -> bool;

    /// Swap `expected` for `replacement` only if the mapping still points at `expected`.
    fn replace_if(&self, page_id: i64, expected: PageRef, replacement: PageRef) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default [`KeyIndex`]: `2^power` hash shards, each behind its own lock.
///
/// The shard is picked from the high bits of the key's hash and the shard's
/// map reuses the same hasher, so keys spread across shards and buckets alike.
pub struct ShardedIndex {
    hash_builder: RandomState,
    shards: Box<[RwLock<HashMap<i64, PageRef, RandomState>>]>,
    shift: u32,
}

impl ShardedIndex {
    /// # Panics
    /// Panics if `power` is outside `4..=16`.
    pub fn new(power: u8) -> Self {
        assert!(
            (4..=16).contains(&power),
            "index power {power} outside 4..=16"
        );

        // Fixed seeds in tests for deterministic behavior, random seeds in production
        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        let shards = (0..1_usize << power)
            .map(|_| RwLock::new(HashMap::with_hasher(hash_builder.clone())))
            .collect();

        Self {
            hash_builder,
            shards,
            shift: 64 - power as u32,
        }
    }

    #[inline]
    fn shard(&self, page_id: i64) -> &RwLock<HashMap<i64, PageRef, RandomState>> {
        let hash = self.hash_builder.hash_one(page_id);
        &self.shards[(hash >> self.shift) as usize]
    }

    #[cfg(test)]
    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl KeyIndex for ShardedIndex {
    fn get(&self, page_id: i64) -> Option<PageRef> {
        self.shard(page_id).read().get(&page_id).copied()
    }

    fn put_if_absent(&self, page_id: i64, entry: PageRef) -> Option<PageRef> {
        let mut shard = self.shard(page_id).write();
        match shard.get(&page_id) {
            Some(existing) => Some(*existing),
            None => {
                shard.insert(page_id, entry);
                None
            }
        }
    }

    fn remove_if(&self, page_id: i64, entry: PageRef) -> bool {
        let mut shard = self.shard(page_id).write();
        if shard.get(&page_id) == Some(&entry) {
            shard.remove(&page_id);
            true
        } else {
            false
        }
    }

    fn replace_if(&self, page_id: i64, expected: PageRef, replacement: PageRef) -> bool {
        let mut shard = self.shard(page_id).write();
        match shard.get_mut(&page_id) {
            Some(current) if *current == expected => {
                *current = replacement;
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }
}
