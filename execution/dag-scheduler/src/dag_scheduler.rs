// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    counters::{DAG, RUN_SECONDS},
    critical_fields::{ConflictVisitor, CriticalFields},
    errors::SchedulerError,
    invoke_callback, ExecuteFn, TxnIndex, TxnScheduler,
};
use concurrent_queue::ConcurrentQueue;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use scopeguard::defer;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tracing::{debug, info};

struct DagNode {
    successors: Vec<TxnIndex>,
    num_predecessors: usize,
    /// Predecessors that have not completed yet in the current run.
    in_degree: CachePadded<AtomicUsize>,
    scheduled: bool,
}

impl DagNode {
    fn new() -> Self {
        Self {
            successors: Vec::new(),
            num_predecessors: 0,
            in_degree: CachePadded::new(AtomicUsize::new(0)),
            scheduled: false,
        }
    }
}

struct DagLayout {
    nodes: Vec<DagNode>,
    all_conflict_txns: Vec<TxnIndex>,
}

impl ConflictVisitor for DagLayout {
    fn on_conflict(&mut self, predecessor: TxnIndex, txn_idx: TxnIndex) {
        self.nodes[predecessor].successors.push(txn_idx);
        let node = &mut self.nodes[txn_idx];
        node.num_predecessors += 1;
        node.scheduled = true;
    }

    fn on_first_conflict(&mut self, txn_idx: TxnIndex) {
        self.nodes[txn_idx].scheduled = true;
    }

    fn on_empty_conflict(&mut self, txn_idx: TxnIndex) {
        self.nodes[txn_idx].scheduled = true;
    }

    fn on_all_conflict(&mut self, txn_idx: TxnIndex) {
        self.all_conflict_txns.push(txn_idx);
    }
}

/// Pull-based scheduler: every worker pops a ready transaction, runs it, then releases
/// its successors. The first successor that becomes ready is kept by the releasing worker,
/// the rest go to the shared ready queue.
///
/// Node states: Pending (in-degree > 0) -> Ready (in the queue or held by a worker)
/// -> Running -> Done. A node enters Ready exactly once per run, when its in-degree
/// reaches zero, so every scheduled transaction is executed exactly once.
pub struct TxDagScheduler {
    nodes: Vec<DagNode>,
    roots: Vec<TxnIndex>,
    num_scheduled: usize,
    all_conflict_txns: Vec<TxnIndex>,
    execute: Option<ExecuteFn>,
    thread_pool: Option<Arc<ThreadPool>>,

    ready_queue: ConcurrentQueue<TxnIndex>,
    /// Transactions whose successors were released in the current run.
    num_consumed: CachePadded<AtomicUsize>,
    num_executed: CachePadded<AtomicUsize>,
    stopped: AtomicBool,
    running: AtomicBool,

    // Workers with nothing to do sleep here until a node becomes ready or the run ends.
    idle_lock: Mutex<()>,
    idle_cvar: Condvar,
}

impl Default for TxDagScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TxDagScheduler {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            roots: Vec::new(),
            num_scheduled: 0,
            all_conflict_txns: Vec::new(),
            execute: None,
            thread_pool: None,
            ready_queue: ConcurrentQueue::unbounded(),
            num_consumed: CachePadded::new(AtomicUsize::new(0)),
            num_executed: CachePadded::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle_cvar: Condvar::new(),
        }
    }

    /// Runs workers on `thread_pool` instead of building a pool for every run. The pool
    /// should have at least as many threads as the requested worker count.
    pub fn with_thread_pool(mut self, thread_pool: Arc<ThreadPool>) -> Self {
        self.thread_pool = Some(thread_pool);
        self
    }

    fn done(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
            || self.num_consumed.load(Ordering::Acquire) == self.num_scheduled
    }

    /// Blocks until a node is ready, returning `None` once the graph is exhausted or the
    /// scheduler was stopped.
    fn wait_pop(&self) -> Option<TxnIndex> {
        loop {
            if self.done() {
                return None;
            }
            if let Ok(txn_idx) = self.ready_queue.pop() {
                return Some(txn_idx);
            }

            let mut guard = self.idle_lock.lock();
            // Pushers notify under the lock, so re-checking here cannot miss a wakeup.
            if self.done() {
                return None;
            }
            if let Ok(txn_idx) = self.ready_queue.pop() {
                return Some(txn_idx);
            }
            self.idle_cvar.wait(&mut guard);
        }
    }

    fn push_ready(&self, txn_idx: TxnIndex) {
        if self.ready_queue.push(txn_idx).is_err() {
            unreachable!("ready queue is never closed");
        }
        let _guard = self.idle_lock.lock();
        self.idle_cvar.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.idle_lock.lock();
        self.idle_cvar.notify_all();
    }

    /// Releases the successors of a finished transaction. Returns one successor that
    /// became ready, for the calling worker to run next.
    fn consume(&self, txn_idx: TxnIndex) -> Option<TxnIndex> {
        let mut next = None;
        for successor in &self.nodes[txn_idx].successors {
            if self.nodes[*successor]
                .in_degree
                .fetch_sub(1, Ordering::AcqRel)
                == 1
            {
                match next {
                    None => next = Some(*successor),
                    Some(_) => self.push_ready(*successor),
                }
            }
        }

        if self.num_consumed.fetch_add(1, Ordering::AcqRel) + 1 == self.num_scheduled {
            self.wake_all();
        }
        next
    }

    fn worker_loop(&self, execute: &ExecuteFn) {
        while let Some(mut txn_idx) = self.wait_pop() {
            loop {
                invoke_callback(DAG, execute, txn_idx);
                self.num_executed.fetch_add(1, Ordering::AcqRel);

                match self.consume(txn_idx) {
                    Some(next) if !self.stopped.load(Ordering::Acquire) => txn_idx = next,
                    _ => break,
                }
            }
        }
    }

    fn reset(&self) {
        while self.ready_queue.pop().is_ok() {}
        for node in &self.nodes {
            node.in_degree
                .store(node.num_predecessors, Ordering::Relaxed);
        }
        for root in &self.roots {
            if self.ready_queue.push(*root).is_err() {
                unreachable!("ready queue is never closed");
            }
        }
        self.num_consumed.store(0, Ordering::Release);
        self.num_executed.store(0, Ordering::Release);
    }
}

impl TxnScheduler for TxDagScheduler {
    fn init(&mut self, critical_fields: &CriticalFields, execute: ExecuteFn) {
        let mut layout = DagLayout {
            nodes: (0..critical_fields.len()).map(|_| DagNode::new()).collect(),
            all_conflict_txns: Vec::new(),
        };
        critical_fields.traverse_dag(&mut layout);

        self.roots = layout
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.scheduled && node.num_predecessors == 0)
            .map(|(txn_idx, _)| txn_idx)
            .collect();
        self.num_scheduled = layout.nodes.iter().filter(|node| node.scheduled).count();
        self.nodes = layout.nodes;
        self.all_conflict_txns = layout.all_conflict_txns;
        self.execute = Some(execute);

        debug!(
            num_txns = critical_fields.len(),
            num_scheduled = self.num_scheduled,
            num_roots = self.roots.len(),
            num_all_conflict = self.all_conflict_txns.len(),
            "initialized transaction DAG"
        );
    }

    fn run(&self, thread_count: usize) -> Result<(), SchedulerError> {
        let execute = self.execute.as_ref().ok_or(SchedulerError::NotInitialized)?;
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

        self.reset();
        if self.num_scheduled == 0 {
            return Ok(());
        }

        let _timer = RUN_SECONDS.with_label_values(&[DAG]).start_timer();
        let num_workers = thread_count.min(self.num_scheduled);
        let thread_pool = match &self.thread_pool {
            Some(thread_pool) => thread_pool.clone(),
            None => Arc::new(
                ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|index| format!("txdag_worker_{}", index))
                    .build()?,
            ),
        };
        thread_pool.scope(|s| {
            for _ in 0..num_workers {
                s.spawn(|_| self.worker_loop(execute));
            }
        });

        info!(
            num_workers = num_workers,
            num_scheduled = self.num_scheduled,
            num_executed = self.have_execute_number(),
            stopped = self.stopped.load(Ordering::Acquire),
            "transaction DAG run finished"
        );
        Ok(())
    }

    fn para_txns_number(&self) -> usize {
        self.num_scheduled
    }

    fn have_execute_number(&self) -> usize {
        self.num_executed.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake_all();
    }

    fn all_conflict_txns(&self) -> &[TxnIndex] {
        &self.all_conflict_txns
    }
}
