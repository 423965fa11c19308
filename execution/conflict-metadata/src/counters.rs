// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

/// Count of contract ABIs fetched and parsed after a metadata cache miss.
pub static ABI_LOADS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txdag_conflict_metadata_abi_loads",
        "Number of function conflict descriptors loaded from contract ABIs"
    )
    .unwrap()
});

/// Count of critical field extractions, labeled by whether the footprint was known.
pub static CRITICAL_FIELD_EXTRACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "txdag_conflict_metadata_extractions",
        "Number of calls whose critical fields were derived, by result",
        &["result"]
    )
    .unwrap()
});
