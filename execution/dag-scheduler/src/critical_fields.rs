// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::TxnIndex;
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// Opaque key of a piece of state a transaction reads or writes.
pub type CriticalField = Vec<u8>;

/// How the graph builder classified a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConflictClass {
    /// Footprint unknown. Never part of the parallel graph.
    AllConflict,
    /// Touches nothing: an unconstrained root.
    EmptyConflict,
    /// First transaction to touch each of its fields: a root that may gate later ones.
    FirstConflict,
    /// Has at least one predecessor.
    Conflict,
}

/// Callbacks of [`CriticalFields::traverse_dag`]. For a given transaction either exactly
/// one of the `on_*_conflict` classifications fires, or `on_conflict` fires once per
/// distinct predecessor, in ascending predecessor order.
pub trait ConflictVisitor {
    fn on_conflict(&mut self, predecessor: TxnIndex, txn_idx: TxnIndex);
    fn on_first_conflict(&mut self, txn_idx: TxnIndex);
    fn on_empty_conflict(&mut self, txn_idx: TxnIndex);
    fn on_all_conflict(&mut self, txn_idx: TxnIndex);
}

/// Materialized result of a traversal.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConflictGraph {
    pub classes: Vec<ConflictClass>,
    /// `(predecessor, successor)` pairs; the predecessor is always the smaller index.
    pub edges: Vec<(TxnIndex, TxnIndex)>,
}

impl ConflictGraph {
    pub fn predecessors(&self, txn_idx: TxnIndex) -> impl Iterator<Item = TxnIndex> + '_ {
        self.edges
            .iter()
            .filter(move |(_, to)| *to == txn_idx)
            .map(|(from, _)| *from)
    }

    pub fn all_conflict_txns(&self) -> Vec<TxnIndex> {
        self.txns_of(ConflictClass::AllConflict)
    }

    pub fn roots(&self) -> Vec<TxnIndex> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(_, class)| {
                matches!(
                    class,
                    ConflictClass::EmptyConflict | ConflictClass::FirstConflict
                )
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    fn txns_of(&self, wanted: ConflictClass) -> Vec<TxnIndex> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(_, class)| **class == wanted)
            .map(|(idx, _)| idx)
            .collect()
    }
}

impl ConflictVisitor for ConflictGraph {
    fn on_conflict(&mut self, predecessor: TxnIndex, txn_idx: TxnIndex) {
        self.classes[txn_idx] = ConflictClass::Conflict;
        self.edges.push((predecessor, txn_idx));
    }

    fn on_first_conflict(&mut self, txn_idx: TxnIndex) {
        self.classes[txn_idx] = ConflictClass::FirstConflict;
    }

    fn on_empty_conflict(&mut self, txn_idx: TxnIndex) {
        self.classes[txn_idx] = ConflictClass::EmptyConflict;
    }

    fn on_all_conflict(&mut self, txn_idx: TxnIndex) {
        self.classes[txn_idx] = ConflictClass::AllConflict;
    }
}

/// Critical fields of every transaction of a block. `None` marks an unknown footprint,
/// which is also the state of a transaction whose fields were never put.
#[derive(Clone, Debug, Default)]
pub struct CriticalFields {
    txn_fields: Vec<Option<Vec<CriticalField>>>,
}

impl CriticalFields {
    pub fn new(num_txns: usize) -> Self {
        Self {
            txn_fields: vec![None; num_txns],
        }
    }

    pub fn put(&mut self, txn_idx: TxnIndex, fields: Option<Vec<CriticalField>>) {
        assert!(
            txn_idx < self.txn_fields.len(),
            "transaction index {} out of range for a block of {}",
            txn_idx,
            self.txn_fields.len()
        );
        self.txn_fields[txn_idx] = fields;
    }

    pub fn get(&self, txn_idx: TxnIndex) -> Option<&[CriticalField]> {
        self.txn_fields[txn_idx].as_deref()
    }

    pub fn len(&self) -> usize {
        self.txn_fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txn_fields.is_empty()
    }

    /// Classifies every transaction in index order and reports conflict edges to
    /// `visitor`. A transaction is recorded as the latest writer of its fields only after
    /// its own predecessors were computed, so every edge points from a smaller index to a
    /// larger one and the graph is acyclic.
    pub fn traverse_dag<V: ConflictVisitor>(&self, visitor: &mut V) {
        let mut writers: HashMap<&[u8], Vec<TxnIndex>> = HashMap::new();
        let mut predecessors = BTreeSet::new();

        for (txn_idx, fields) in self.txn_fields.iter().enumerate() {
            let Some(fields) = fields else {
                trace!(txn_idx = txn_idx, "unknown critical fields");
                visitor.on_all_conflict(txn_idx);
                continue;
            };
            if fields.is_empty() {
                visitor.on_empty_conflict(txn_idx);
                continue;
            }

            predecessors.clear();
            for field in fields {
                if let Some(prior) = writers.get(field.as_slice()) {
                    predecessors.extend(prior.iter().copied());
                }
            }
            if predecessors.is_empty() {
                visitor.on_first_conflict(txn_idx);
            } else {
                for predecessor in &predecessors {
                    visitor.on_conflict(*predecessor, txn_idx);
                }
            }

            for field in fields {
                let history = writers.entry(field.as_slice()).or_default();
                if history.last() != Some(&txn_idx) {
                    history.push(txn_idx);
                }
            }
        }
    }

    pub fn build_graph(&self) -> ConflictGraph {
        let mut graph = ConflictGraph {
            classes: vec![ConflictClass::AllConflict; self.len()],
            edges: Vec::new(),
        };
        self.traverse_dag(&mut graph);
        graph
    }
}

impl From<Vec<Option<Vec<CriticalField>>>> for CriticalFields {
    fn from(txn_fields: Vec<Option<Vec<CriticalField>>>) -> Self {
        Self { txn_fields }
    }
}
