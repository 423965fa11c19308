// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! A small dataflow runtime of continue nodes.
//!
//! A continue node runs its body once every incoming edge has signaled, then signals all
//! of its outgoing edges. Nodes linked to the broadcast start node fire as soon as
//! [`FlowGraph::try_put`] injects the start signal. Bodies run as tasks on a rayon pool;
//! the runtime knows nothing about what they do.

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::error;

pub type NodeId = usize;

type NodeBody = Box<dyn Fn() + Send + Sync>;

struct ContinueNode {
    body: NodeBody,
    successors: Vec<NodeId>,
    fan_in: usize,
    pending_signals: CachePadded<AtomicUsize>,
}

/// Graph under construction.
#[derive(Default)]
pub struct FlowGraphBuilder {
    nodes: Vec<ContinueNode>,
    start_successors: Vec<NodeId>,
}

impl FlowGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, body: impl Fn() + Send + Sync + 'static) -> NodeId {
        self.nodes.push(ContinueNode {
            body: Box::new(body),
            successors: Vec::new(),
            fan_in: 0,
            pending_signals: CachePadded::new(AtomicUsize::new(0)),
        });
        self.nodes.len() - 1
    }

    /// Links `to` after `from`: `to` fires only after `from` completed.
    pub fn make_edge(&mut self, from: NodeId, to: NodeId) {
        assert!(from < self.nodes.len() && to < self.nodes.len());
        self.nodes[from].successors.push(to);
        self.nodes[to].fan_in += 1;
    }

    /// Links `to` to the broadcast start node.
    pub fn connect_start(&mut self, to: NodeId) {
        assert!(to < self.nodes.len());
        self.start_successors.push(to);
        self.nodes[to].fan_in += 1;
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn build(self) -> Arc<FlowGraph> {
        Arc::new(FlowGraph {
            nodes: self.nodes,
            start_successors: self.start_successors,
            completed: CachePadded::new(AtomicUsize::new(0)),
            in_flight: Mutex::new(false),
            all_done: Condvar::new(),
        })
    }
}

pub struct FlowGraph {
    nodes: Vec<ContinueNode>,
    start_successors: Vec<NodeId>,
    completed: CachePadded<AtomicUsize>,
    /// Set between `try_put` and the completion of the last node.
    in_flight: Mutex<bool>,
    all_done: Condvar,
}

impl FlowGraph {
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Injects the start signal, spawning every node linked to the start node on `pool`.
    /// Returns false without doing anything if a previous activation is still running.
    ///
    /// Nodes that are reachable neither from the start node nor from a node that is will
    /// never fire, and [`FlowGraph::wait_for_all`] would block forever.
    pub fn try_put(self: &Arc<Self>, pool: &Arc<ThreadPool>) -> bool {
        {
            let mut in_flight = self.in_flight.lock();
            if *in_flight {
                return false;
            }
            if self.nodes.is_empty() {
                return true;
            }
            *in_flight = true;
        }

        self.completed.store(0, Ordering::Relaxed);
        for node in &self.nodes {
            node.pending_signals.store(node.fan_in, Ordering::Relaxed);
        }
        for node_id in &self.start_successors {
            self.signal(pool, *node_id);
        }
        true
    }

    /// Blocks until every node of the current activation has completed.
    pub fn wait_for_all(&self) {
        let mut in_flight = self.in_flight.lock();
        while *in_flight {
            self.all_done.wait(&mut in_flight);
        }
    }

    fn signal(self: &Arc<Self>, pool: &Arc<ThreadPool>, node_id: NodeId) {
        if self.nodes[node_id]
            .pending_signals
            .fetch_sub(1, Ordering::AcqRel)
            != 1
        {
            return;
        }
        let graph = self.clone();
        let task_pool = pool.clone();
        pool.spawn(move || graph.fire(&task_pool, node_id));
    }

    fn fire(self: &Arc<Self>, pool: &Arc<ThreadPool>, node_id: NodeId) {
        let node = &self.nodes[node_id];
        // A panic escaping a rayon task aborts the process.
        if catch_unwind(AssertUnwindSafe(|| (node.body)())).is_err() {
            error!(node_id = node_id, "flow graph node body panicked");
        }
        for successor in &node.successors {
            self.signal(pool, *successor);
        }

        if self.completed.fetch_add(1, Ordering::AcqRel) + 1 == self.nodes.len() {
            let mut in_flight = self.in_flight.lock();
            *in_flight = false;
            self.all_done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(num_threads: usize) -> Arc<ThreadPool> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn diamond_respects_edges() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = FlowGraphBuilder::new();
        let ids: Vec<_> = (0..4)
            .map(|i| {
                let log = log.clone();
                builder.add_node(move || log.lock().push(i))
            })
            .collect();
        builder.connect_start(ids[0]);
        builder.make_edge(ids[0], ids[1]);
        builder.make_edge(ids[0], ids[2]);
        builder.make_edge(ids[1], ids[3]);
        builder.make_edge(ids[2], ids[3]);
        let graph = builder.build();

        let pool = pool(4);
        for _ in 0..10 {
            log.lock().clear();
            assert!(graph.try_put(&pool));
            graph.wait_for_all();
            let order = log.lock().clone();
            assert_eq!(order.len(), 4);
            assert_eq!(order[0], 0);
            assert_eq!(order[3], 3);
        }
    }

    #[test]
    fn empty_graph_completes_immediately() {
        let graph = FlowGraphBuilder::new().build();
        assert!(graph.try_put(&pool(1)));
        graph.wait_for_all();
    }

    #[test]
    fn panicking_body_still_releases_successors() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut builder = FlowGraphBuilder::new();
        let first = builder.add_node(|| panic!("boom"));
        let second = {
            let ran = ran.clone();
            builder.add_node(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        builder.connect_start(first);
        builder.make_edge(first, second);
        let graph = builder.build();
        assert!(graph.try_put(&pool(2)));
        graph.wait_for_all();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
