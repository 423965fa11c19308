// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    new_scheduler, CriticalField, CriticalFields, ExecuteFn, GraphEngineScheduler,
    SchedulerError, SchedulerKind, TxDagScheduler, TxnIndex, TxnScheduler,
};
use claims::{assert_err, assert_matches, assert_ok};
use parking_lot::Mutex;
use proptest::{collection::vec, option, prelude::*};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

const KINDS: [SchedulerKind; 2] = [SchedulerKind::Dag, SchedulerKind::GraphEngine];

fn fields(keys: &[&str]) -> Option<Vec<CriticalField>> {
    Some(keys.iter().map(|key| key.as_bytes().to_vec()).collect())
}

/// Records every callback and checks that all predecessors completed before it started.
struct ExecutionTracker {
    predecessors: Vec<Vec<TxnIndex>>,
    completed: Vec<AtomicBool>,
    executions: Vec<AtomicUsize>,
    order_violated: AtomicBool,
    order: Mutex<Vec<TxnIndex>>,
}

impl ExecutionTracker {
    fn new(block: &CriticalFields) -> Arc<Self> {
        let graph = block.build_graph();
        Arc::new(Self {
            predecessors: (0..block.len())
                .map(|txn_idx| graph.predecessors(txn_idx).collect())
                .collect(),
            completed: (0..block.len()).map(|_| AtomicBool::new(false)).collect(),
            executions: (0..block.len()).map(|_| AtomicUsize::new(0)).collect(),
            order_violated: AtomicBool::new(false),
            order: Mutex::new(Vec::new()),
        })
    }

    fn execute_fn(self: &Arc<Self>) -> ExecuteFn {
        let tracker = self.clone();
        Arc::new(move |txn_idx: TxnIndex| tracker.execute(txn_idx))
    }

    fn execute(&self, txn_idx: TxnIndex) {
        if self.predecessors[txn_idx]
            .iter()
            .any(|pred| !self.completed[*pred].load(Ordering::SeqCst))
        {
            self.order_violated.store(true, Ordering::SeqCst);
        }
        self.executions[txn_idx].fetch_add(1, Ordering::SeqCst);
        self.order.lock().push(txn_idx);
        self.completed[txn_idx].store(true, Ordering::SeqCst);
    }

    fn execution_counts(&self) -> Vec<usize> {
        self.executions
            .iter()
            .map(|count| count.load(Ordering::SeqCst))
            .collect()
    }
}

fn run_block(
    kind: SchedulerKind,
    block: &CriticalFields,
    thread_count: usize,
) -> (Box<dyn TxnScheduler>, Arc<ExecutionTracker>) {
    let tracker = ExecutionTracker::new(block);
    let mut scheduler = new_scheduler(kind);
    scheduler.init(block, tracker.execute_fn());
    assert_ok!(scheduler.run(thread_count));
    (scheduler, tracker)
}

#[test]
fn shared_field_is_executed_in_order() {
    let block = CriticalFields::from(vec![fields(&["X"]), fields(&["X"]), fields(&[])]);
    for kind in KINDS {
        for _ in 0..20 {
            let (scheduler, tracker) = run_block(kind, &block, 4);
            assert_eq!(scheduler.have_execute_number(), 3);
            assert_eq!(scheduler.para_txns_number(), 3);
            assert!(scheduler.all_conflict_txns().is_empty());
            let order = tracker.order.lock().clone();
            let position = |txn_idx| order.iter().position(|idx| *idx == txn_idx);
            assert!(position(0) < position(1));
            assert!(!tracker.order_violated.load(Ordering::SeqCst));
        }
    }
}

#[test]
fn unknown_footprints_are_left_to_the_caller() {
    let block = CriticalFields::from(vec![None, fields(&["a"]), fields(&["a"]), None]);
    for kind in KINDS {
        let (scheduler, tracker) = run_block(kind, &block, 2);
        assert_eq!(scheduler.all_conflict_txns(), &[0, 3]);
        assert_eq!(scheduler.para_txns_number(), 2);
        assert_eq!(scheduler.have_execute_number(), 2);
        assert_eq!(tracker.execution_counts(), vec![0, 1, 1, 0]);
    }
}

#[test]
fn misuse_is_reported() {
    for kind in KINDS {
        let scheduler = new_scheduler(kind);
        assert_matches!(scheduler.run(4), Err(SchedulerError::NotInitialized));

        let mut scheduler = new_scheduler(kind);
        scheduler.init(&CriticalFields::new(1), Arc::new(|_: TxnIndex| {}));
        assert_matches!(scheduler.run(0), Err(SchedulerError::NoWorkers));
    }
}

#[test]
fn empty_block_runs() {
    for kind in KINDS {
        let (scheduler, _) = run_block(kind, &CriticalFields::new(0), 8);
        assert_eq!(scheduler.para_txns_number(), 0);
        assert_eq!(scheduler.have_execute_number(), 0);
    }
}

#[test]
fn panicking_callback_does_not_starve_successors() {
    let block = CriticalFields::from((0..8).map(|_| fields(&["hot"])).collect::<Vec<_>>());
    for kind in KINDS {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let execute: ExecuteFn = {
            let executed = executed.clone();
            Arc::new(move |txn_idx: TxnIndex| {
                executed.lock().push(txn_idx);
                if txn_idx == 3 {
                    panic!("transaction {} failed", txn_idx);
                }
            })
        };
        let mut scheduler = new_scheduler(kind);
        scheduler.init(&block, execute);
        assert_ok!(scheduler.run(4));
        assert_eq!(*executed.lock(), (0..8).collect::<Vec<_>>());
        assert_eq!(scheduler.have_execute_number(), 8);
    }
}

#[test]
fn stop_halts_a_chain() {
    let block = CriticalFields::from((0..100).map(|_| fields(&["hot"])).collect::<Vec<_>>());
    for kind in KINDS {
        let stopper: Arc<Mutex<Option<Arc<dyn TxnScheduler>>>> = Arc::new(Mutex::new(None));
        let executed = Arc::new(AtomicUsize::new(0));
        let execute: ExecuteFn = {
            let stopper = stopper.clone();
            let executed = executed.clone();
            Arc::new(move |txn_idx: TxnIndex| {
                executed.fetch_add(1, Ordering::SeqCst);
                if txn_idx == 10 {
                    if let Some(scheduler) = stopper.lock().as_ref() {
                        scheduler.stop();
                    }
                }
            })
        };
        let mut scheduler = new_scheduler(kind);
        scheduler.init(&block, execute);
        let scheduler: Arc<dyn TxnScheduler> = Arc::from(scheduler);
        *stopper.lock() = Some(scheduler.clone());

        assert_ok!(scheduler.run(4));
        assert_eq!(executed.load(Ordering::SeqCst), 11);
        assert_eq!(scheduler.have_execute_number(), 11);

        // Stop is sticky.
        assert_ok!(scheduler.run(4));
        assert_eq!(executed.load(Ordering::SeqCst), 11);
        stopper.lock().take();
    }
}

#[test]
fn dag_scheduler_can_rerun_on_a_shared_pool() {
    let block = CriticalFields::from(vec![
        fields(&["a"]),
        fields(&["b"]),
        fields(&["a", "b"]),
        fields(&[]),
    ]);
    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap(),
    );
    let tracker = ExecutionTracker::new(&block);
    let mut scheduler = TxDagScheduler::new().with_thread_pool(pool.clone());
    scheduler.init(&block, tracker.execute_fn());
    for _ in 0..3 {
        assert_ok!(scheduler.run(4));
        assert_eq!(scheduler.have_execute_number(), 4);
        tracker.completed.iter().for_each(|done| done.store(false, Ordering::SeqCst));
    }
    assert_eq!(tracker.execution_counts(), vec![3; 4]);
    assert!(!tracker.order_violated.load(Ordering::SeqCst));

    let mut graph_engine = GraphEngineScheduler::new().with_thread_pool(pool);
    graph_engine.init(&block, Arc::new(|_: TxnIndex| {}));
    assert_ok!(graph_engine.run(4));
    assert_eq!(graph_engine.have_execute_number(), 4);
}

#[test]
fn concurrent_runs_are_rejected() {
    let block = CriticalFields::from(vec![fields(&[]), fields(&[])]);
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let execute: ExecuteFn = {
        let entered = entered.clone();
        let release = release.clone();
        Arc::new(move |_: TxnIndex| {
            entered.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
        })
    };
    let mut scheduler = TxDagScheduler::new();
    scheduler.init(&block, execute);
    let scheduler = Arc::new(scheduler);

    let runner = {
        let scheduler = scheduler.clone();
        std::thread::spawn(move || scheduler.run(2))
    };
    while !entered.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    assert_err!(scheduler.run(2));
    release.store(true, Ordering::SeqCst);
    assert_ok!(runner.join().unwrap());
}

fn arb_block() -> impl Strategy<Value = CriticalFields> {
    vec(option::weighted(0.9, vec(0u8..12, 0..3)), 0..80).prop_map(|txns| {
        CriticalFields::from(
            txns.into_iter()
                .map(|keys| keys.map(|keys| keys.into_iter().map(|k| vec![k]).collect()))
                .collect::<Vec<_>>(),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_scheduled_txn_runs_once_after_its_predecessors(
        block in arb_block(),
        thread_count in prop_oneof![Just(1usize), Just(2), Just(8), Just(64)],
        kind in prop_oneof![Just(SchedulerKind::Dag), Just(SchedulerKind::GraphEngine)],
    ) {
        let (scheduler, tracker) = run_block(kind, &block, thread_count);
        let all_conflict = scheduler.all_conflict_txns().to_vec();
        for (txn_idx, count) in tracker.execution_counts().into_iter().enumerate() {
            let expected = usize::from(!all_conflict.contains(&txn_idx));
            prop_assert_eq!(count, expected);
        }
        prop_assert_eq!(scheduler.para_txns_number(), block.len() - all_conflict.len());
        prop_assert_eq!(scheduler.have_execute_number(), scheduler.para_txns_number());
        prop_assert!(!tracker.order_violated.load(Ordering::SeqCst));
    }
}
