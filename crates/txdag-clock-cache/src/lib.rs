// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! A bounded, sharded, concurrent key-value cache with CLOCK (second-chance) eviction.
//!
//! Keys are spread over `2^shard_bits` independent shards. Each shard owns a mutex that
//! serializes structural changes (insert, eviction, slot recycling), a concurrent hash
//! index and a clock ring over a slot arena that only grows. Lookups and handle releases
//! never take the shard mutex.
//!
//! A value stays alive while it is in the cache or while any [`CacheHandle`] to it exists.
//! Eviction never removes an entry that has an outstanding handle, so an insert into a
//! shard whose entries are all pinned fails and the caller proceeds uncached.
//!
//! Capacity is accounted per shard, so the aggregate bound is approximate.

mod counters;
mod handle;
mod shard;
mod slot;


pub use crate::handle::CacheHandle;
use crate::{counters::CACHE_LOOKUPS, shard::Shard};
use ahash::RandomState;
use std::{
    hash::{BuildHasher, Hash},
    sync::Arc,
};

pub const DEFAULT_SHARD_BITS: u32 = 4;
pub const MAX_SHARD_BITS: u32 = 16;

pub struct ClockCache<K, V>
where
    K: Hash + Eq + Clone,
{
    shards: Vec<Arc<Shard<K, V>>>,
    shard_bits: u32,
    hasher: RandomState,
}

impl<K, V> ClockCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Creates a cache with [`DEFAULT_SHARD_BITS`] shards, each holding up to
    /// `capacity_per_shard` entries.
    pub fn new(capacity_per_shard: usize) -> Self {
        Self::with_shard_bits(capacity_per_shard, DEFAULT_SHARD_BITS)
    }

    pub fn with_shard_bits(capacity_per_shard: usize, shard_bits: u32) -> Self {
        assert!(
            shard_bits <= MAX_SHARD_BITS,
            "shard bits {} exceed the maximum of {}",
            shard_bits,
            MAX_SHARD_BITS
        );
        Self {
            shards: (0..1usize << shard_bits)
                .map(|_| Arc::new(Shard::new(capacity_per_shard)))
                .collect(),
            shard_bits,
            hasher: RandomState::new(),
        }
    }

    /// Inserts `key -> value`, replacing any previous value for `key`. Returns false if the
    /// target shard is full of referenced entries; the value is dropped in that case.
    pub fn insert(&self, key: K, value: V) -> bool {
        let hash = self.hasher.hash_one(&key);
        self.shard(hash).insert(hash, key, value, false).is_ok()
    }

    /// Like [`ClockCache::insert`], but also returns a handle on the new entry. On failure
    /// the value is handed back so the caller can keep using it uncached.
    pub fn insert_and_lookup(&self, key: K, value: V) -> Result<CacheHandle<K, V>, V> {
        let hash = self.hasher.hash_one(&key);
        let shard = self.shard(hash);
        let (slot_idx, slot) = shard.insert(hash, key, value, true)?;
        match slot.entry() {
            Some(entry) => Ok(CacheHandle::new(shard.clone(), slot_idx, slot, entry)),
            // The slot was occupied by us and is pinned by the reference we hold.
            None => unreachable!("freshly inserted slot lost its entry"),
        }
    }

    /// Returns a handle on the value cached for `key`, or `None` on a miss. A lookup racing
    /// with the eviction of `key` reports a miss rather than retrying.
    pub fn lookup(&self, key: &K) -> Option<CacheHandle<K, V>> {
        let hash = self.hasher.hash_one(key);
        let shard = self.shard(hash);
        let handle = Self::lookup_in_shard(shard, hash, key);
        CACHE_LOOKUPS
            .with_label_values(&[if handle.is_some() { "hit" } else { "miss" }])
            .inc();
        handle
    }

    /// Removes `key` from the cache. Returns whether it was present.
    pub fn erase(&self, key: &K) -> bool {
        let hash = self.hasher.hash_one(key);
        self.shard(hash).erase(key)
    }

    /// Changes the per-shard capacity, evicting unreferenced entries as needed.
    pub fn set_capacity(&self, capacity_per_shard: usize) {
        for shard in &self.shards {
            shard.set_capacity(capacity_per_shard);
        }
    }

    /// Aggregate capacity over all shards.
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|shard| shard.capacity()).sum()
    }

    /// Number of entries currently counted against capacity.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|shard| shard.usage()).sum()
    }

    /// Number of keys reachable through the index.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, hash: u64) -> &Arc<Shard<K, V>> {
        let idx = if self.shard_bits == 0 {
            0
        } else {
            (hash >> (u64::BITS - self.shard_bits)) as usize
        };
        &self.shards[idx]
    }

    fn lookup_in_shard(shard: &Arc<Shard<K, V>>, hash: u64, key: &K) -> Option<CacheHandle<K, V>> {
        let slot_idx = shard.find(key)?;
        let slot = shard.slot(slot_idx)?;
        if !slot.try_ref() {
            return None;
        }
        // The slot may have been evicted and reused for another key between the index
        // read and taking the reference.
        match slot.entry() {
            Some(entry) if entry.hash == hash && entry.key == *key => {
                Some(CacheHandle::new(shard.clone(), slot_idx, slot, entry))
            },
            _ => {
                shard.release(slot_idx, &slot, false);
                None
            },
        }
    }
}
