// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Parallel execution of a block of transactions along a conflict graph.
//!
//! [`CriticalFields`] turns the per-transaction critical fields into a DAG whose edges
//! order every pair of transactions that share a field. Two back-ends execute the graph:
//!
//! * [`TxDagScheduler`]: worker threads pull ready transactions from a shared queue and
//!   gate successors with atomic in-degree counters.
//! * [`GraphEngineScheduler`]: the graph is mapped onto a generic dataflow runtime
//!   ([`flow_graph::FlowGraph`]) that owns the fan-in bookkeeping.
//!
//! Transactions whose footprint is unknown are excluded by both back-ends and reported
//! through [`TxnScheduler::all_conflict_txns`]; the caller runs them serially.

mod counters;
pub mod critical_fields;
mod dag_scheduler;
pub mod errors;
pub mod flow_graph;
mod graph_engine;

pub use crate::{
    critical_fields::{ConflictClass, ConflictGraph, ConflictVisitor, CriticalField, CriticalFields},
    dag_scheduler::TxDagScheduler,
    errors::SchedulerError,
    graph_engine::GraphEngineScheduler,
};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tracing::error;

pub type TxnIndex = usize;

/// The host side effect of running one transaction. It must be safe to invoke
/// concurrently for transactions that are not ordered by the conflict graph.
pub type ExecuteFn = Arc<dyn Fn(TxnIndex) + Send + Sync>;

/// Common interface of the parallel back-ends.
pub trait TxnScheduler: Send + Sync {
    /// Builds the execution graph of a block. Must be called before [`TxnScheduler::run`].
    fn init(&mut self, critical_fields: &CriticalFields, execute: ExecuteFn);

    /// Executes the graph with `thread_count` workers and blocks until every scheduled
    /// transaction ran or the scheduler was stopped.
    fn run(&self, thread_count: usize) -> Result<(), SchedulerError>;

    /// Number of transactions scheduled in parallel.
    fn para_txns_number(&self) -> usize;

    /// Number of callbacks invoked so far.
    fn have_execute_number(&self) -> usize;

    /// Cooperative cancellation, observed between transactions. Idempotent.
    fn stop(&self);

    /// Transactions left out of the graph because their footprint is unknown, ascending.
    fn all_conflict_txns(&self) -> &[TxnIndex];
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Dag,
    GraphEngine,
}

pub fn new_scheduler(kind: SchedulerKind) -> Box<dyn TxnScheduler> {
    match kind {
        SchedulerKind::Dag => Box::new(TxDagScheduler::new()),
        SchedulerKind::GraphEngine => Box::new(GraphEngineScheduler::new()),
    }
}

/// Like [`new_scheduler`], with workers running on a caller-owned pool. `run` must not be
/// called from a thread of that pool.
pub fn new_scheduler_with_thread_pool(
    kind: SchedulerKind,
    thread_pool: Arc<ThreadPool>,
) -> Box<dyn TxnScheduler> {
    match kind {
        SchedulerKind::Dag => Box::new(TxDagScheduler::new().with_thread_pool(thread_pool)),
        SchedulerKind::GraphEngine => {
            Box::new(GraphEngineScheduler::new().with_thread_pool(thread_pool))
        },
    }
}

/// Runs the callback of `txn_idx`, containing a panic so the rest of the graph is still
/// released. Returns false if the callback panicked.
pub(crate) fn invoke_callback(scheduler: &str, execute: &ExecuteFn, txn_idx: TxnIndex) -> bool {
    let result = catch_unwind(AssertUnwindSafe(|| execute(txn_idx)));
    counters::EXECUTED_TXNS.with_label_values(&[scheduler]).inc();
    if let Err(panic) = result {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        error!(
            scheduler = scheduler,
            txn_idx = txn_idx,
            panic = %message,
            "transaction callback panicked"
        );
        counters::CALLBACK_PANICS.with_label_values(&[scheduler]).inc();
        return false;
    }
    true
}

#[cfg(test)]
mod tests;
