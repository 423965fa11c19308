// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram, register_int_counter_vec, Histogram, IntCounterVec,
};

pub const PARALLEL: &str = "parallel";
pub const SERIAL: &str = "serial";

/// Wall time of executing one block end to end.
pub static BLOCK_EXECUTION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "txdag_executor_block_execution_seconds",
        "Time spent executing a block along its conflict graph",
        exponential_buckets(/*start=*/ 1e-3, /*factor=*/ 2.0, /*count=*/ 16).unwrap()
    )
    .unwrap()
});

/// Count of executed transactions, labeled by execution mode.
pub static EXECUTED_TXNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "txdag_executor_executed_txns",
        "Number of transactions executed, by mode",
        &["mode"]
    )
    .unwrap()
});
