// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    counters::{CACHE_EVICTIONS, CACHE_INSERT_FAILURES},
    slot::{CacheEntry, ClockVisit, Slot},
};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{hash::Hash, sync::Arc};
use tracing::trace;

type SlotArena<K, V> = Vec<Arc<Slot<K, V>>>;

/// Structural state of a shard, only touched with the shard mutex held.
struct ShardState {
    capacity: usize,
    /// Number of slots currently in the cache.
    usage: usize,
    clock_hand: usize,
    free_list: Vec<usize>,
}

/// One independent partition of the cache: its own mutex, index and clock ring.
pub(crate) struct Shard<K, V> {
    /// Growable arena of slots. It never shrinks, so slot indices stay valid for the
    /// lifetime of the shard and can be read without the mutex.
    slots: ArcSwap<SlotArena<K, V>>,
    index: DashMap<K, usize>,
    state: Mutex<ShardState>,
}

impl<K, V> Shard<K, V>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: ArcSwap::from_pointee(Vec::new()),
            index: DashMap::new(),
            state: Mutex::new(ShardState {
                capacity,
                usage: 0,
                clock_hand: 0,
                free_list: Vec::new(),
            }),
        }
    }

    pub(crate) fn slot(&self, idx: usize) -> Option<Arc<Slot<K, V>>> {
        self.slots.load().get(idx).cloned()
    }

    /// Index lookup without the shard mutex.
    pub(crate) fn find(&self, key: &K) -> Option<usize> {
        self.index.get(key).map(|idx| *idx)
    }

    /// Inserts `key -> value`. On success returns the slot holding the new entry, with one
    /// reference already taken if `with_ref` is set. On failure (nothing evictable) the
    /// value is handed back.
    pub(crate) fn insert(
        &self,
        hash: u64,
        key: K,
        value: V,
        with_ref: bool,
    ) -> Result<(usize, Arc<Slot<K, V>>), V> {
        let mut state = self.state.lock();

        // A live entry for the same key is about to be replaced, so it does not count
        // against the room we need.
        let replacing = self
            .find(&key)
            .and_then(|idx| self.slot(idx))
            .is_some_and(|slot| slot.is_in_cache());
        if !self.evict(&mut state, usize::from(replacing)) {
            CACHE_INSERT_FAILURES.inc();
            trace!(usage = state.usage, capacity = state.capacity, "clock cache shard is full");
            return Err(value);
        }

        let (idx, slot) = match state.free_list.pop() {
            Some(idx) => match self.slot(idx) {
                Some(slot) => (idx, slot),
                None => unreachable!("free list points outside of the arena"),
            },
            None => self.grow(),
        };
        slot.occupy(
            CacheEntry {
                hash,
                key: key.clone(),
                value,
            },
            with_ref,
        );

        if let Some(previous) = self.index.insert(key, idx) {
            if previous != idx {
                self.retire_slot(&mut state, previous);
            }
        }
        state.usage += 1;

        Ok((idx, slot))
    }

    /// Removes `key` from the cache. Outstanding handles keep the value alive.
    pub(crate) fn erase(&self, key: &K) -> bool {
        let mut state = self.state.lock();
        match self.index.remove(key) {
            Some((_, idx)) => {
                self.retire_slot(&mut state, idx);
                true
            },
            None => false,
        }
    }

    /// Releases one reference on `slot`, recycling it if this was the last one and the
    /// slot had already left the cache.
    pub(crate) fn release(&self, idx: usize, slot: &Slot<K, V>, set_usage: bool) {
        if slot.unref(set_usage) {
            let mut state = self.state.lock();
            Self::recycle(&mut state, idx, slot);
        }
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        // Nothing is inserted afterwards, so usage may stay at capacity. Pinned entries
        // stay until their handles are released.
        self.evict(&mut state, 1);
    }

    pub(crate) fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub(crate) fn usage(&self) -> usize {
        self.state.lock().usage
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    fn grow(&self) -> (usize, Arc<Slot<K, V>>) {
        let slot = Arc::new(Slot::new());
        let mut arena: SlotArena<K, V> = self.slots.load().as_ref().clone();
        arena.push(slot.clone());
        let idx = arena.len() - 1;
        self.slots.store(Arc::new(arena));
        (idx, slot)
    }

    fn retire_slot(&self, state: &mut ShardState, idx: usize) {
        let Some(slot) = self.slot(idx) else {
            return;
        };
        if let Some(unreferenced) = slot.retire() {
            state.usage -= 1;
            if unreferenced {
                Self::recycle(state, idx, &slot);
            }
        }
    }

    fn recycle(state: &mut ShardState, idx: usize, slot: &Slot<K, V>) {
        slot.vacate();
        state.free_list.push(idx);
    }

    /// Runs the clock hand until `usage < capacity + allowance`. An allowance of 0 makes
    /// room for one more entry, an allowance of 1 only trims down to capacity. Gives up, returning false,
    /// once a full revolution passes without evicting an entry or clearing a usage bit.
    /// Every revolution either makes progress or ends the scan, and a revolution that
    /// only clears usage bits is followed by one that can evict, so a single call scans
    /// at most two revolutions.
    fn evict(&self, state: &mut ShardState, allowance: usize) -> bool {
        let slots = self.slots.load();
        let ring_len = slots.len();
        let mut idle_steps = 0;
        let mut steps = 0;

        while state.usage >= state.capacity + allowance {
            if ring_len == 0 || idle_steps >= ring_len || steps >= 2 * ring_len {
                return false;
            }
            let idx = state.clock_hand % ring_len;
            state.clock_hand = (idx + 1) % ring_len;
            steps += 1;

            let slot = &slots[idx];
            match slot.visit() {
                ClockVisit::Evicted => {
                    if let Some(entry) = slot.entry() {
                        self.index.remove_if(&entry.key, |_, mapped| *mapped == idx);
                    }
                    state.usage -= 1;
                    Self::recycle(state, idx, slot);
                    CACHE_EVICTIONS.inc();
                    idle_steps = 0;
                },
                ClockVisit::SecondChance => idle_steps = 0,
                ClockVisit::Vacant | ClockVisit::Referenced => idle_steps += 1,
            }
        }
        true
    }
}
