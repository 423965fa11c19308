// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    abi::{call_selector, FunctionAbi, SELECTOR_LENGTH},
    counters::{ABI_LOADS, CRITICAL_FIELD_EXTRACTIONS},
    errors::{AbiError, Result},
    extract::{extract_critical_fields, CallContext, CriticalField},
};
use parking_lot::Mutex;
use std::ops::Deref;
use tracing::{debug, warn};
use txdag_clock_cache::{CacheHandle, ClockCache};

/// Where contract ABIs come from, typically the state storage of the current block.
pub trait AbiSource: Send + Sync {
    /// Returns the JSON ABI deployed at `receiver`, or `None` if the contract has none.
    fn contract_abi(&self, receiver: &[u8]) -> anyhow::Result<Option<String>>;
}

/// Parsed metadata of one function, either pinned in the cache or owned by the caller
/// because the cache had no room for it.
#[derive(Debug)]
pub enum FunctionAbiRef {
    Cached(CacheHandle<Vec<u8>, FunctionAbi>),
    Uncached(FunctionAbi),
}

impl Deref for FunctionAbiRef {
    type Target = FunctionAbi;

    fn deref(&self) -> &FunctionAbi {
        match self {
            Self::Cached(handle) => handle.value(),
            Self::Uncached(abi) => abi,
        }
    }
}

/// Caches parsed function metadata per `receiver ‖ selector`.
pub struct ConflictMetadataCache {
    cache: ClockCache<Vec<u8>, FunctionAbi>,
    /// Serializes loads so concurrent misses on one function parse its ABI once.
    load_lock: Mutex<()>,
    sm_crypto: bool,
}

impl ConflictMetadataCache {
    pub fn new(capacity_per_shard: usize, shard_bits: u32, sm_crypto: bool) -> Self {
        Self {
            cache: ClockCache::with_shard_bits(capacity_per_shard, shard_bits),
            load_lock: Mutex::new(()),
            sm_crypto,
        }
    }

    /// Returns the metadata of the function `call_data` invokes on `receiver`, loading and
    /// parsing the contract ABI from `source` on a miss.
    pub fn function_abi(
        &self,
        receiver: &[u8],
        call_data: &[u8],
        source: &dyn AbiSource,
    ) -> Result<FunctionAbiRef> {
        call_selector(call_data)?;
        let mut cache_key = Vec::with_capacity(receiver.len() + SELECTOR_LENGTH);
        cache_key.extend_from_slice(receiver);
        cache_key.extend_from_slice(&call_data[..SELECTOR_LENGTH]);

        if let Some(handle) = self.cache.lookup(&cache_key) {
            return Ok(FunctionAbiRef::Cached(handle));
        }

        let _guard = self.load_lock.lock();
        if let Some(handle) = self.cache.lookup(&cache_key) {
            return Ok(FunctionAbiRef::Cached(handle));
        }

        let abi_json = source
            .contract_abi(receiver)?
            .ok_or_else(|| AbiError::MissingAbi(hex::encode(receiver)))?;
        let abi = FunctionAbi::deserialize(&abi_json, call_data, self.sm_crypto)?;
        ABI_LOADS.inc();
        debug!(
            receiver = %hex::encode(receiver),
            function = %abi.name,
            "loaded function conflict metadata"
        );

        Ok(match self.cache.insert_and_lookup(cache_key, abi) {
            Ok(handle) => FunctionAbiRef::Cached(handle),
            Err(abi) => FunctionAbiRef::Uncached(abi),
        })
    }

    /// Critical fields of one call, or `None` if its footprint is unknown. Metadata
    /// failures are logged and reported as unknown.
    pub fn critical_fields(
        &self,
        call: &CallContext<'_>,
        source: &dyn AbiSource,
    ) -> Option<Vec<CriticalField>> {
        let fields = match self.function_abi(call.receiver, call.call_data, source) {
            Ok(abi) => extract_critical_fields(&abi, call),
            Err(err) => {
                warn!(
                    receiver = %hex::encode(call.receiver),
                    error = %err,
                    "no usable conflict metadata, call runs serially"
                );
                None
            },
        };
        CRITICAL_FIELD_EXTRACTIONS
            .with_label_values(&[if fields.is_some() { "known" } else { "unknown" }])
            .inc();
        fields
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
