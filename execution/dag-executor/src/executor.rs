// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::DagExecutionConfig,
    counters::{BLOCK_EXECUTION_SECONDS, EXECUTED_TXNS, PARALLEL, SERIAL},
    errors::BlockExecutionError,
};
use parking_lot::Mutex;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, error, info};
use txdag_conflict_metadata::{AbiSource, CallContext, ConflictMetadataCache};
use txdag_scheduler::{
    new_scheduler_with_thread_pool, CriticalFields, ExecuteFn, TxnIndex, TxnScheduler,
};

/// Block-level values conflict fields may refer to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockContext {
    pub number: u64,
    pub timestamp: u64,
}

/// One contract call of a block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Call {
    pub sender: Vec<u8>,
    pub origin: Vec<u8>,
    pub receiver: Vec<u8>,
    /// Selector followed by the ABI encoded arguments.
    pub data: Vec<u8>,
    /// Contract deployment. Its footprint is never known in advance.
    pub create: bool,
}

/// Executes a single transaction against the block state. Calls the conflict graph does
/// not order may be executed concurrently.
pub trait TransactionExecutor: Send + Sync + 'static {
    type Output: Send + 'static;

    fn execute_transaction(&self, txn_idx: TxnIndex, call: &Call) -> Self::Output;
}

/// How a precompiled contract takes part in parallel execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PrecompiledFootprint {
    /// The call only touches state identified by these tags.
    Parallel(Vec<Vec<u8>>),
    /// The contract cannot run in parallel with anything.
    Serial,
}

/// Contracts built into the node. Their footprint comes from the contract itself rather
/// than from ABI conflict metadata.
pub trait PrecompiledContracts: Send + Sync {
    /// Returns `None` if `receiver` is not a precompiled contract.
    fn footprint(&self, receiver: &[u8], call_data: &[u8]) -> Option<PrecompiledFootprint>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionMode {
    Parallel,
    Serial,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxnOutput<O> {
    pub output: O,
    pub mode: ExecutionMode,
}

type OutputSlots<O> = Arc<Vec<Mutex<Option<TxnOutput<O>>>>>;

/// Executes blocks along their conflict graph: calls with a known footprint run in
/// parallel on the configured scheduler, the rest run serially afterwards in block order.
pub struct DagBlockExecutor {
    config: DagExecutionConfig,
    metadata_cache: ConflictMetadataCache,
    precompiled: Option<Arc<dyn PrecompiledContracts>>,
    executor_thread_pool: Arc<ThreadPool>,
}

impl DagBlockExecutor {
    pub fn new(config: DagExecutionConfig) -> Result<Self, BlockExecutionError> {
        config.sanitize()?;
        let executor_thread_pool = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(config.concurrency_level)
                .thread_name(|index| format!("txdag_exe_{}", index))
                .build()?,
        );
        Ok(Self {
            metadata_cache: ConflictMetadataCache::new(
                config.abi_cache_capacity,
                config.abi_cache_shard_bits,
                config.sm_crypto,
            ),
            precompiled: None,
            executor_thread_pool,
            config,
        })
    }

    /// Consults `precompiled` before the metadata cache for every call.
    pub fn with_precompiled(mut self, precompiled: Arc<dyn PrecompiledContracts>) -> Self {
        self.precompiled = Some(precompiled);
        self
    }

    pub fn config(&self) -> &DagExecutionConfig {
        &self.config
    }

    /// Derives the critical fields of every call in parallel. Deployments, non-parallel
    /// precompiled contracts and calls without usable conflict metadata get an unknown
    /// footprint. Precompiled tags are keyed as `tag ‖ receiver`.
    pub fn critical_fields(
        &self,
        block: &BlockContext,
        calls: &[Call],
        abi_source: &dyn AbiSource,
    ) -> CriticalFields {
        let fields = self.executor_thread_pool.install(|| {
            calls
                .par_iter()
                .enumerate()
                .map(|(txn_idx, call)| {
                    if call.create {
                        debug!(txn_idx = txn_idx, "contract deployment runs serially");
                        return None;
                    }
                    if let Some(footprint) = self
                        .precompiled
                        .as_ref()
                        .and_then(|precompiled| precompiled.footprint(&call.receiver, &call.data))
                    {
                        return match footprint {
                            PrecompiledFootprint::Parallel(tags) => Some(
                                tags.into_iter()
                                    .map(|mut tag| {
                                        tag.extend_from_slice(&call.receiver);
                                        tag
                                    })
                                    .collect(),
                            ),
                            PrecompiledFootprint::Serial => {
                                debug!(
                                    txn_idx = txn_idx,
                                    receiver = %hex::encode(&call.receiver),
                                    "precompiled contract can't run in parallel"
                                );
                                None
                            },
                        };
                    }
                    self.metadata_cache.critical_fields(
                        &CallContext {
                            sender: &call.sender,
                            origin: &call.origin,
                            receiver: &call.receiver,
                            call_data: &call.data,
                            timestamp: block.timestamp,
                            block_number: block.number,
                        },
                        abi_source,
                    )
                })
                .collect::<Vec<_>>()
        });
        CriticalFields::from(fields)
    }

    pub fn execute_block<E: TransactionExecutor>(
        &self,
        block: &BlockContext,
        calls: Vec<Call>,
        abi_source: &dyn AbiSource,
        executor: Arc<E>,
    ) -> Result<Vec<TxnOutput<E::Output>>, BlockExecutionError> {
        let _timer = BLOCK_EXECUTION_SECONDS.start_timer();
        let num_txns = calls.len();
        if num_txns == 0 {
            return Ok(vec![]);
        }

        let critical_fields = self.critical_fields(block, &calls, abi_source);
        let calls = Arc::new(calls);
        let outputs: OutputSlots<E::Output> =
            Arc::new((0..num_txns).map(|_| Mutex::new(None)).collect());

        let execute: ExecuteFn = {
            let calls = calls.clone();
            let outputs = outputs.clone();
            let executor = executor.clone();
            Arc::new(move |txn_idx: TxnIndex| {
                let output = executor.execute_transaction(txn_idx, &calls[txn_idx]);
                *outputs[txn_idx].lock() = Some(TxnOutput {
                    output,
                    mode: ExecutionMode::Parallel,
                });
            })
        };

        let mut scheduler = new_scheduler_with_thread_pool(
            self.config.scheduler_kind,
            self.executor_thread_pool.clone(),
        );
        scheduler.init(&critical_fields, execute);
        scheduler.run(self.config.concurrency_level)?;
        let num_parallel = scheduler.have_execute_number();
        EXECUTED_TXNS
            .with_label_values(&[PARALLEL])
            .inc_by(num_parallel as u64);

        let serial_txns = scheduler.all_conflict_txns();
        for txn_idx in serial_txns {
            // Contained like a parallel callback: the slot stays empty and the block fails
            // with `MissingOutput`.
            match catch_unwind(AssertUnwindSafe(|| {
                executor.execute_transaction(*txn_idx, &calls[*txn_idx])
            })) {
                Ok(output) => {
                    *outputs[*txn_idx].lock() = Some(TxnOutput {
                        output,
                        mode: ExecutionMode::Serial,
                    });
                },
                Err(_) => error!(txn_idx = *txn_idx, "serial transaction panicked"),
            }
        }
        EXECUTED_TXNS
            .with_label_values(&[SERIAL])
            .inc_by(serial_txns.len() as u64);

        info!(
            block_number = block.number,
            num_txns = num_txns,
            num_parallel = num_parallel,
            num_serial = serial_txns.len(),
            scheduler = ?self.config.scheduler_kind,
            "executed block"
        );

        outputs
            .iter()
            .enumerate()
            .map(|(txn_idx, slot)| {
                slot.lock()
                    .take()
                    .ok_or(BlockExecutionError::MissingOutput(txn_idx))
            })
            .collect()
    }
}
