// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    shard::Shard,
    slot::{CacheEntry, Slot},
};
use std::{fmt, hash::Hash, sync::Arc};

/// A reference to a cached value. While the handle is alive its entry cannot be evicted;
/// dropping it releases the reference and marks the entry as recently used.
pub struct CacheHandle<K, V>
where
    K: Hash + Eq + Clone,
{
    shard: Arc<Shard<K, V>>,
    slot_idx: usize,
    slot: Arc<Slot<K, V>>,
    // Dropped after `Drop::drop` has released the slot. If that release recycled the
    // slot, this is the last owner and the entry destructor runs here.
    entry: Arc<CacheEntry<K, V>>,
}

impl<K, V> CacheHandle<K, V>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new(
        shard: Arc<Shard<K, V>>,
        slot_idx: usize,
        slot: Arc<Slot<K, V>>,
        entry: Arc<CacheEntry<K, V>>,
    ) -> Self {
        Self {
            shard,
            slot_idx,
            slot,
            entry,
        }
    }

    pub fn key(&self) -> &K {
        &self.entry.key
    }

    pub fn value(&self) -> &V {
        &self.entry.value
    }

    /// Explicitly gives the reference back. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl<K, V> Drop for CacheHandle<K, V>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        self.shard.release(self.slot_idx, &self.slot, true);
    }
}

impl<K, V> fmt::Debug for CacheHandle<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}
