// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    counters::{GRAPH_ENGINE, RUN_SECONDS},
    critical_fields::{ConflictVisitor, CriticalFields},
    errors::SchedulerError,
    flow_graph::{FlowGraph, FlowGraphBuilder, NodeId},
    invoke_callback, ExecuteFn, TxnIndex, TxnScheduler,
};
use rayon::{ThreadPool, ThreadPoolBuilder};
use scopeguard::defer;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tracing::{debug, info};

/// Progress shared between the scheduler and the bodies of its graph nodes.
#[derive(Default)]
struct Progress {
    num_executed: AtomicUsize,
    stopped: AtomicBool,
}

/// Maps conflict classifications onto flow-graph nodes. Only transactions with a known
/// footprint become nodes.
struct GraphMapper {
    builder: FlowGraphBuilder,
    node_of: Vec<Option<NodeId>>,
    all_conflict_txns: Vec<TxnIndex>,
    execute: ExecuteFn,
    progress: Arc<Progress>,
}

impl GraphMapper {
    fn node(&mut self, txn_idx: TxnIndex) -> NodeId {
        if let Some(node_id) = self.node_of[txn_idx] {
            return node_id;
        }
        let execute = self.execute.clone();
        let progress = self.progress.clone();
        let node_id = self.builder.add_node(move || {
            if progress.stopped.load(Ordering::Acquire) {
                return;
            }
            invoke_callback(GRAPH_ENGINE, &execute, txn_idx);
            progress.num_executed.fetch_add(1, Ordering::AcqRel);
        });
        self.node_of[txn_idx] = Some(node_id);
        node_id
    }

    fn root(&mut self, txn_idx: TxnIndex) {
        let node_id = self.node(txn_idx);
        self.builder.connect_start(node_id);
    }
}

impl ConflictVisitor for GraphMapper {
    fn on_conflict(&mut self, predecessor: TxnIndex, txn_idx: TxnIndex) {
        let from = self.node(predecessor);
        let to = self.node(txn_idx);
        self.builder.make_edge(from, to);
    }

    fn on_first_conflict(&mut self, txn_idx: TxnIndex) {
        self.root(txn_idx);
    }

    fn on_empty_conflict(&mut self, txn_idx: TxnIndex) {
        self.root(txn_idx);
    }

    fn on_all_conflict(&mut self, txn_idx: TxnIndex) {
        self.all_conflict_txns.push(txn_idx);
    }
}

/// Scheduler backed by [`FlowGraph`]: one continue node per scheduled transaction, fired
/// once all of its predecessors completed.
pub struct GraphEngineScheduler {
    graph: Option<Arc<FlowGraph>>,
    all_conflict_txns: Vec<TxnIndex>,
    progress: Arc<Progress>,
    thread_pool: Option<Arc<ThreadPool>>,
    running: AtomicBool,
}

impl Default for GraphEngineScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphEngineScheduler {
    pub fn new() -> Self {
        Self {
            graph: None,
            all_conflict_txns: Vec::new(),
            progress: Arc::new(Progress::default()),
            thread_pool: None,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_thread_pool(mut self, thread_pool: Arc<ThreadPool>) -> Self {
        self.thread_pool = Some(thread_pool);
        self
    }
}

impl TxnScheduler for GraphEngineScheduler {
    fn init(&mut self, critical_fields: &CriticalFields, execute: ExecuteFn) {
        let mut mapper = GraphMapper {
            builder: FlowGraphBuilder::new(),
            node_of: vec![None; critical_fields.len()],
            all_conflict_txns: Vec::new(),
            execute,
            progress: self.progress.clone(),
        };
        critical_fields.traverse_dag(&mut mapper);

        debug!(
            num_txns = critical_fields.len(),
            num_nodes = mapper.builder.num_nodes(),
            num_all_conflict = mapper.all_conflict_txns.len(),
            "built transaction flow graph"
        );
        self.all_conflict_txns = mapper.all_conflict_txns;
        self.graph = Some(mapper.builder.build());
    }

    fn run(&self, thread_count: usize) -> Result<(), SchedulerError> {
        let graph = self.graph.as_ref().ok_or(SchedulerError::NotInitialized)?;
        if thread_count == 0 {
            return Err(SchedulerError::NoWorkers);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        defer! {
            self.running.store(false, Ordering::Release);
        }

        self.progress.num_executed.store(0, Ordering::Release);
        if graph.num_nodes() == 0 {
            return Ok(());
        }

        let _timer = RUN_SECONDS.with_label_values(&[GRAPH_ENGINE]).start_timer();
        let thread_pool = match &self.thread_pool {
            Some(thread_pool) => thread_pool.clone(),
            None => Arc::new(
                ThreadPoolBuilder::new()
                    .num_threads(thread_count.min(graph.num_nodes()))
                    .thread_name(|index| format!("txdag_flow_{}", index))
                    .build()?,
            ),
        };
        if !graph.try_put(&thread_pool) {
            return Err(SchedulerError::AlreadyRunning);
        }
        graph.wait_for_all();

        info!(
            num_nodes = graph.num_nodes(),
            num_executed = self.have_execute_number(),
            stopped = self.progress.stopped.load(Ordering::Acquire),
            "transaction flow graph run finished"
        );
        Ok(())
    }

    fn para_txns_number(&self) -> usize {
        self.graph.as_ref().map_or(0, |graph| graph.num_nodes())
    }

    fn have_execute_number(&self) -> usize {
        self.progress.num_executed.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.progress.stopped.store(true, Ordering::Release);
    }

    fn all_conflict_txns(&self) -> &[TxnIndex] {
        &self.all_conflict_txns
    }
}
