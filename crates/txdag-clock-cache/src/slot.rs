// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

/// Set while the slot is reachable through the shard index.
pub(crate) const IN_CACHE: u32 = 1;
/// Second-chance marker, set on handle release and cleared by the clock hand.
pub(crate) const USAGE: u32 = 1 << 1;
const REF_SHIFT: u32 = 2;
/// One reference unit in the packed flags word.
pub(crate) const ONE_REF: u32 = 1 << REF_SHIFT;

#[inline]
fn ref_count(flags: u32) -> u32 {
    flags >> REF_SHIFT
}

/// What the clock hand did to a slot it visited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ClockVisit {
    /// Slot was not in the cache (free, or retired but still referenced).
    Vacant,
    /// Slot is pinned by at least one handle.
    Referenced,
    /// Usage bit was set and has been cleared.
    SecondChance,
    /// In-cache bit was cleared; the caller now owns the cleanup.
    Evicted,
}

/// The immutable payload of an occupied slot.
pub(crate) struct CacheEntry<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: V,
}

/// One arena slot. The flags word packs `IN_CACHE | USAGE | refs << 2` so that
/// "clear in-cache iff refs == 0" and "refs reaches 0 while not in cache" are
/// each decided by a single atomic operation.
pub(crate) struct Slot<K, V> {
    flags: CachePadded<AtomicU32>,
    entry: ArcSwapOption<CacheEntry<K, V>>,
}

impl<K, V> Slot<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            flags: CachePadded::new(AtomicU32::new(0)),
            entry: ArcSwapOption::empty(),
        }
    }

    /// Publishes a new entry into a free slot. Must only be called on a slot that is
    /// neither in the cache nor referenced, with the shard mutex held.
    pub(crate) fn occupy(&self, entry: CacheEntry<K, V>, with_ref: bool) {
        debug_assert_eq!(self.flags.load(Ordering::Relaxed) & !USAGE, 0);
        self.entry.store(Some(Arc::new(entry)));
        let initial = if with_ref { IN_CACHE | ONE_REF } else { IN_CACHE };
        self.flags.store(initial, Ordering::Release);
    }

    /// Drops the slot's own reference to the entry. The entry destructor runs here unless a
    /// handle still holds the entry, in which case it runs when that handle goes away.
    pub(crate) fn vacate(&self) {
        self.entry.store(None);
    }

    pub(crate) fn entry(&self) -> Option<Arc<CacheEntry<K, V>>> {
        self.entry.load_full()
    }

    pub(crate) fn is_in_cache(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IN_CACHE != 0
    }

    /// Takes a reference, but only while the slot is still in the cache. Never retries
    /// past an eviction: once the in-cache bit is gone the lookup is a miss.
    pub(crate) fn try_ref(&self) -> bool {
        let mut current = self.flags.load(Ordering::Acquire);
        loop {
            if current & IN_CACHE == 0 {
                return false;
            }
            match self.flags.compare_exchange_weak(
                current,
                current + ONE_REF,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Releases one reference, optionally marking the slot as recently used. Returns true
    /// if this call observed the last reference going away on a slot that is no longer in
    /// the cache: the caller is then the only thread allowed to recycle the slot.
    pub(crate) fn unref(&self, set_usage: bool) -> bool {
        let usage = if set_usage { USAGE } else { 0 };
        let mut current = self.flags.load(Ordering::Acquire);
        loop {
            debug_assert!(ref_count(current) > 0, "unref without a reference");
            let next = (current | usage) - ONE_REF;
            match self.flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ref_count(next) == 0 && next & IN_CACHE == 0,
                Err(observed) => current = observed,
            }
        }
    }

    /// Lazily removes the slot from the cache. Returns `None` if it was already out of
    /// the cache, otherwise whether no references were outstanding (in which case the
    /// caller must recycle the slot; otherwise the last `unref` will).
    pub(crate) fn retire(&self) -> Option<bool> {
        let previous = self.flags.fetch_and(!IN_CACHE, Ordering::AcqRel);
        if previous & IN_CACHE == 0 {
            None
        } else {
            Some(ref_count(previous) == 0)
        }
    }

    /// One step of the clock hand. Called with the shard mutex held.
    pub(crate) fn visit(&self) -> ClockVisit {
        let mut current = self.flags.load(Ordering::Acquire);
        loop {
            if current & IN_CACHE == 0 {
                return ClockVisit::Vacant;
            }
            if ref_count(current) > 0 {
                return ClockVisit::Referenced;
            }
            let (next, outcome) = if current & USAGE != 0 {
                (current & !USAGE, ClockVisit::SecondChance)
            } else {
                (0, ClockVisit::Evicted)
            };
            match self.flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return outcome,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupied(with_ref: bool) -> Slot<u64, u64> {
        let slot = Slot::new();
        slot.occupy(
            CacheEntry {
                hash: 7,
                key: 1,
                value: 10,
            },
            with_ref,
        );
        slot
    }

    #[test]
    fn referenced_slot_is_never_evicted() {
        let slot = occupied(true);
        assert_eq!(slot.visit(), ClockVisit::Referenced);
        assert!(!slot.unref(false));
        assert_eq!(slot.visit(), ClockVisit::Evicted);
        assert_eq!(slot.visit(), ClockVisit::Vacant);
    }

    #[test]
    fn usage_bit_grants_a_second_chance() {
        let slot = occupied(true);
        assert!(!slot.unref(true));
        assert_eq!(slot.visit(), ClockVisit::SecondChance);
        assert_eq!(slot.visit(), ClockVisit::Evicted);
    }

    #[test]
    fn last_unref_after_retire_owns_cleanup() {
        let slot = occupied(true);
        assert!(slot.try_ref());
        assert_eq!(slot.retire(), Some(false));
        assert_eq!(slot.retire(), None);
        assert!(!slot.try_ref());
        assert!(!slot.unref(true));
        assert!(slot.unref(false));
    }

    #[test]
    fn retire_without_refs_hands_cleanup_to_caller() {
        let slot = occupied(false);
        assert_eq!(slot.retire(), Some(true));
        assert!(!slot.is_in_cache());
    }
}
