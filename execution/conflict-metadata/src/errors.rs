// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Reasons conflict metadata could not be produced for a call. Every variant degrades the
/// call to full seriality; none of them is fatal to block execution.
#[derive(Debug, Error)]
pub enum AbiError {
    #[error("malformed contract ABI: {0}")]
    Json(#[from] serde_json::Error),
    #[error("call data is {0} bytes, too short to carry a selector")]
    ShortCallData(usize),
    #[error("no state-mutating function matches selector {0:#010x}")]
    NoMatchingFunction(u32),
    #[error("function {function} declares unknown conflict field kind {kind}")]
    UnknownConflictKind { function: String, kind: u8 },
    #[error("function {function} has an invalid conflict field: {reason}")]
    InvalidConflictField { function: String, reason: String },
    #[error("no ABI deployed for contract 0x{0}")]
    MissingAbi(String),
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

pub type Result<T, E = AbiError> = std::result::Result<T, E>;
