// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

/// Count of cache lookups, labeled by outcome ("hit" or "miss").
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "txdag_clock_cache_lookups",
        "Number of clock cache lookups, by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Count of inserts rejected because no entry could be evicted.
pub static CACHE_INSERT_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txdag_clock_cache_insert_failures",
        "Number of clock cache inserts that found nothing evictable"
    )
    .unwrap()
});

/// Count of entries evicted by the clock hand.
pub static CACHE_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txdag_clock_cache_evictions",
        "Number of entries evicted by the clock hand"
    )
    .unwrap()
});
