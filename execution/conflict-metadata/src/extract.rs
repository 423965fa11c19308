// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::abi::{ConflictFieldKind, EnvKind, FunctionAbi, SELECTOR_LENGTH};
use tracing::debug;

/// Normalized identifier of a piece of state a call reads or writes.
pub type CriticalField = Vec<u8>;

const WORD_SIZE: usize = 32;

/// Everything about one call that conflict fields can refer to.
#[derive(Clone, Copy, Debug)]
pub struct CallContext<'a> {
    pub sender: &'a [u8],
    pub origin: &'a [u8],
    pub receiver: &'a [u8],
    /// Selector followed by the ABI encoded arguments.
    pub call_data: &'a [u8],
    pub timestamp: u64,
    pub block_number: u64,
}

/// Turns the conflict fields of `abi` into the critical keys of one call.
///
/// Returns `None` when the footprint of the call cannot be bounded: the function declares
/// no conflict fields, declares an `All` field, or an argument referenced by a `Var` field
/// cannot be read from the call data.
pub fn extract_critical_fields(
    abi: &FunctionAbi,
    call: &CallContext<'_>,
) -> Option<Vec<CriticalField>> {
    if abi.conflict_fields.is_empty() {
        return None;
    }
    let arguments = call.call_data.get(SELECTOR_LENGTH..)?;

    let mut fields = Vec::with_capacity(abi.conflict_fields.len());
    for conflict_field in &abi.conflict_fields {
        let mut key = Vec::with_capacity(call.receiver.len() + 1 + WORD_SIZE);
        key.extend_from_slice(call.receiver);
        key.push(conflict_field.slot.unwrap_or_default());

        match conflict_field.kind {
            ConflictFieldKind::All => {
                debug!(function = %abi.name, "conflict field covers all state");
                return None;
            },
            ConflictFieldKind::Len | ConflictFieldKind::None => {},
            ConflictFieldKind::Env => match conflict_field.env_kind()? {
                EnvKind::Caller => key.extend_from_slice(call.sender),
                EnvKind::Origin => key.extend_from_slice(call.origin),
                EnvKind::Now => key.extend_from_slice(&call.timestamp.to_be_bytes()),
                EnvKind::BlockNumber => key.extend_from_slice(&call.block_number.to_be_bytes()),
                EnvKind::Addr => key.extend_from_slice(call.receiver),
            },
            ConflictFieldKind::Var => {
                let index = usize::from(*conflict_field.value.first()?);
                let type_name = abi.flat_inputs.get(index)?;
                match component_bytes(arguments, index, type_name) {
                    Some(bytes) => key.extend_from_slice(bytes),
                    None => {
                        debug!(
                            function = %abi.name,
                            index = index,
                            call_data_len = call.call_data.len(),
                            "argument referenced by conflict field is out of range"
                        );
                        return None;
                    },
                }
            },
            ConflictFieldKind::Const => key.extend_from_slice(&conflict_field.value),
        }

        debug!(
            function = %abi.name,
            kind = ?conflict_field.kind,
            critical_key = %hex::encode(&key),
            "extracted critical field"
        );
        fields.push(key);
    }
    Some(fields)
}

/// Raw encoding of the `index`-th top-level argument: its head word, or the payload of
/// the tail for `string` and `bytes`.
fn component_bytes<'a>(arguments: &'a [u8], index: usize, type_name: &str) -> Option<&'a [u8]> {
    let head_start = index.checked_mul(WORD_SIZE)?;
    let head = arguments.get(head_start..head_start.checked_add(WORD_SIZE)?)?;
    if type_name != "string" && type_name != "bytes" {
        return Some(head);
    }

    let offset = word_to_usize(head)?;
    let length_word = arguments.get(offset..offset.checked_add(WORD_SIZE)?)?;
    let length = word_to_usize(length_word)?;
    let data_start = offset + WORD_SIZE;
    arguments.get(data_start..data_start.checked_add(length)?)
}

fn word_to_usize(word: &[u8]) -> Option<usize> {
    let (high, low) = word.split_at(WORD_SIZE - std::mem::size_of::<u64>());
    if high.iter().any(|byte| *byte != 0) {
        return None;
    }
    let low: [u8; 8] = low.try_into().ok()?;
    usize::try_from(u64::from_be_bytes(low)).ok()
}
