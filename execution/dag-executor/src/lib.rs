// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Block execution driven by function conflict metadata.
//!
//! For every call of a block the executor derives critical fields from the callee's
//! conflict metadata, builds the conflict graph and hands it to one of the parallel
//! schedulers. Calls whose footprint is unknown run serially once the parallel part is
//! done, so they never overlap with anything.

pub mod config;
mod counters;
pub mod errors;
mod executor;

pub use crate::{
    config::DagExecutionConfig,
    errors::{BlockExecutionError, ConfigError},
    executor::{
        BlockContext, Call, DagBlockExecutor, ExecutionMode, PrecompiledContracts,
        PrecompiledFootprint, TransactionExecutor, TxnOutput,
    },
};
