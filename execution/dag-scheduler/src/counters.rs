// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram_vec, register_int_counter_vec, HistogramVec,
    IntCounterVec,
};

pub const DAG: &str = "dag";
pub const GRAPH_ENGINE: &str = "graph_engine";

/// Count of transaction callbacks invoked, labeled by scheduler back-end.
pub static EXECUTED_TXNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "txdag_scheduler_executed_txns",
        "Number of transaction callbacks invoked by the parallel schedulers",
        &["scheduler"]
    )
    .unwrap()
});

/// Count of transaction callbacks that panicked.
pub static CALLBACK_PANICS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "txdag_scheduler_callback_panics",
        "Number of transaction callbacks that panicked",
        &["scheduler"]
    )
    .unwrap()
});

/// Wall time of one scheduler run.
pub static RUN_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "txdag_scheduler_run_seconds",
        "Time spent running the parallel part of a block",
        &["scheduler"],
        exponential_buckets(/*start=*/ 1e-4, /*factor=*/ 2.0, /*count=*/ 20).unwrap()
    )
    .unwrap()
});
