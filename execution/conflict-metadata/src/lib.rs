// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Conflict metadata of contract functions and the critical fields it yields for a call.
//!
//! Critical fields are opaque byte keys. Two calls that share a key may touch the same
//! state and must not run concurrently; a call whose keys cannot be derived is treated
//! as conflicting with everything.

pub mod abi;
mod cache;
mod counters;
pub mod errors;
mod extract;

pub use crate::{
    abi::{ConflictField, ConflictFieldKind, EnvKind, FunctionAbi, ParameterAbi},
    cache::{AbiSource, ConflictMetadataCache, FunctionAbiRef},
    errors::AbiError,
    extract::{extract_critical_fields, CallContext, CriticalField},
};
pub use txdag_clock_cache::MAX_SHARD_BITS as MAX_CACHE_SHARD_BITS;
