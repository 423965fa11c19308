// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Parsed conflict metadata of a single contract function.
//!
//! A contract ABI is a JSON array of descriptors. State-mutating functions may carry a
//! `conflictFields` array, each element `{kind, value, slot}` describing one storage
//! location the function touches. The `selector` array holds the 4-byte call selector
//! under both signature schemes, `[keccak, sm]`, as big-endian integers.

use crate::errors::{AbiError, Result};
use serde::Deserialize;
use tiny_keccak::{Hasher, Keccak};
use tracing::trace;

pub const SELECTOR_LENGTH: usize = 4;

/// How a conflict field maps a call onto a critical key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConflictFieldKind {
    /// The function may touch anything: the call conflicts with every other call.
    All,
    /// The length of a dynamic storage collection; keyed by slot only.
    Len,
    /// An execution-environment value, selected by [`EnvKind`].
    Env,
    /// The value of a call parameter, selected by an access path into the inputs.
    Var,
    /// A constant key given verbatim in the metadata.
    Const,
    /// Keyed by slot only.
    None,
}

impl TryFrom<u8> for ConflictFieldKind {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        Ok(match code {
            0 => Self::All,
            1 => Self::Len,
            2 => Self::Env,
            3 => Self::Var,
            4 => Self::Const,
            5 => Self::None,
            unknown => return Err(unknown),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EnvKind {
    Caller,
    Origin,
    Now,
    BlockNumber,
    Addr,
}

impl TryFrom<u8> for EnvKind {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        Ok(match code {
            0 => Self::Caller,
            1 => Self::Origin,
            2 => Self::Now,
            3 => Self::BlockNumber,
            4 => Self::Addr,
            unknown => return Err(unknown),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConflictField {
    pub kind: ConflictFieldKind,
    /// Access path (for `Var`), environment selector (for `Env`) or literal key bytes
    /// (for `Const`).
    pub value: Vec<u8>,
    pub slot: Option<u8>,
}

impl ConflictField {
    /// The environment value an `Env` field refers to.
    pub fn env_kind(&self) -> Option<EnvKind> {
        match (self.kind, self.value.as_slice()) {
            (ConflictFieldKind::Env, [code]) => EnvKind::try_from(*code).ok(),
            _ => None,
        }
    }
}

/// A node of the ordered parameter-type tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParameterAbi {
    pub name: String,
    pub type_name: String,
    pub components: Vec<ParameterAbi>,
}

impl ParameterAbi {
    /// Canonical type as used in a function signature; tuples expand their components.
    pub fn canonical_type(&self) -> String {
        match self.type_name.strip_prefix("tuple") {
            Some(array_suffix) => {
                let inner: Vec<_> = self.components.iter().map(Self::canonical_type).collect();
                format!("({}){}", inner.join(","), array_suffix)
            },
            None => self.type_name.clone(),
        }
    }
}

/// Immutable conflict description of one contract function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FunctionAbi {
    pub name: String,
    pub selector: u32,
    pub inputs: Vec<ParameterAbi>,
    /// Canonical type of each top-level input, indexed by `Var` access paths.
    pub flat_inputs: Vec<String>,
    pub conflict_fields: Vec<ConflictField>,
}

#[derive(Deserialize)]
struct RawFunction {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<RawParameter>,
    #[serde(default)]
    selector: Vec<u32>,
    #[serde(rename = "stateMutability", default)]
    state_mutability: Option<String>,
    #[serde(default)]
    constant: bool,
    #[serde(rename = "conflictFields", default)]
    conflict_fields: Vec<RawConflictField>,
}

impl RawFunction {
    fn is_state_mutating(&self) -> bool {
        !self.constant
            && !matches!(self.state_mutability.as_deref(), Some("view") | Some("pure"))
    }
}

#[derive(Deserialize)]
struct RawParameter {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    components: Vec<RawParameter>,
}

impl From<RawParameter> for ParameterAbi {
    fn from(raw: RawParameter) -> Self {
        Self {
            name: raw.name,
            type_name: raw.type_name,
            components: raw.components.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Deserialize)]
struct RawConflictField {
    kind: u8,
    #[serde(default, alias = "path")]
    value: Vec<u8>,
    #[serde(default)]
    slot: Option<u8>,
}

/// Reads the 4-byte call selector from the head of the call data as a big-endian integer.
pub fn call_selector(call_data: &[u8]) -> Result<u32> {
    call_data
        .get(..SELECTOR_LENGTH)
        .and_then(|head| <[u8; SELECTOR_LENGTH]>::try_from(head).ok())
        .map(u32::from_be_bytes)
        .ok_or(AbiError::ShortCallData(call_data.len()))
}

/// Keccak-256 based selector of a canonical function signature such as
/// `transfer(string,string,uint256)`.
pub fn keccak_selector(signature: &str) -> u32 {
    let mut hasher = Keccak::v256();
    hasher.update(signature.as_bytes());
    let mut digest = [0u8; 32];
    hasher.finalize(&mut digest);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl FunctionAbi {
    /// Parses the function of `abi_json` whose selector matches `selector` (the first four
    /// bytes of the call data). `sm_crypto` picks which of the two selector encodings to
    /// compare against. View and pure functions never match.
    pub fn deserialize(abi_json: &str, selector: &[u8], sm_crypto: bool) -> Result<Self> {
        let expected = call_selector(selector)?;
        let functions: Vec<RawFunction> = serde_json::from_str(abi_json)?;

        for raw in functions {
            if raw.kind != "function" || !raw.is_state_mutating() {
                continue;
            }
            let inputs: Vec<ParameterAbi> = raw.inputs.into_iter().map(Into::into).collect();
            let declared = raw.selector.get(usize::from(sm_crypto)).copied();
            let selector = match declared {
                Some(selector) => selector,
                // Older ABIs omit the selector; it can only be recomputed for keccak.
                None if !sm_crypto => keccak_selector(&signature(&raw.name, &inputs)),
                None => continue,
            };
            if selector != expected {
                continue;
            }

            let conflict_fields = raw
                .conflict_fields
                .into_iter()
                .map(|field| Self::parse_conflict_field(&raw.name, field))
                .collect::<Result<Vec<_>>>()?;
            trace!(
                function = %raw.name,
                selector = format_args!("{:#010x}", selector),
                num_conflict_fields = conflict_fields.len(),
                "parsed function conflict metadata"
            );
            return Ok(Self {
                name: raw.name,
                selector,
                flat_inputs: inputs.iter().map(ParameterAbi::canonical_type).collect(),
                inputs,
                conflict_fields,
            });
        }
        Err(AbiError::NoMatchingFunction(expected))
    }

    pub fn signature(&self) -> String {
        signature(&self.name, &self.inputs)
    }

    fn parse_conflict_field(function: &str, raw: RawConflictField) -> Result<ConflictField> {
        let kind =
            ConflictFieldKind::try_from(raw.kind).map_err(|kind| AbiError::UnknownConflictKind {
                function: function.to_string(),
                kind,
            })?;
        let invalid = |reason: String| AbiError::InvalidConflictField {
            function: function.to_string(),
            reason,
        };
        match kind {
            ConflictFieldKind::Env => match raw.value.as_slice() {
                [code] => {
                    EnvKind::try_from(*code)
                        .map_err(|code| invalid(format!("unknown environment kind {}", code)))?;
                },
                other => {
                    return Err(invalid(format!(
                        "environment field needs exactly one selector byte, got {}",
                        other.len()
                    )))
                },
            },
            ConflictFieldKind::Var if raw.value.is_empty() => {
                return Err(invalid("parameter field has an empty access path".to_string()))
            },
            _ => {},
        }
        Ok(ConflictField {
            kind,
            value: raw.value,
            slot: raw.slot,
        })
    }
}

fn signature(name: &str, inputs: &[ParameterAbi]) -> String {
    let types: Vec<_> = inputs.iter().map(ParameterAbi::canonical_type).collect();
    format!("{}({})", name, types.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_matches, assert_ok};

    pub(crate) const TRANSFER_ABI: &str = r#"[
        {"conflictFields":[{"kind":3,"slot":0,"value":[0]}],"inputs":[{"internalType":"string","name":"name","type":"string"}],"name":"balanceOf","outputs":[{"internalType":"uint256","name":"","type":"uint256"}],"selector":[904814471,0],"stateMutability":"view","type":"function"},
        {"conflictFields":[{"kind":3,"slot":0,"value":[0]}],"inputs":[{"internalType":"string","name":"name","type":"string"},{"internalType":"uint256","name":"num","type":"uint256"}],"name":"set","outputs":[],"selector":[2319641577,0],"stateMutability":"nonpayable","type":"function"},
        {"conflictFields":[{"kind":3,"slot":0,"value":[0]},{"kind":3,"slot":0,"value":[1]}],"inputs":[{"internalType":"string","name":"from","type":"string"},{"internalType":"string","name":"to","type":"string"},{"internalType":"uint256","name":"num","type":"uint256"}],"name":"transfer","outputs":[],"selector":[2608902224,0],"stateMutability":"nonpayable","type":"function"}
    ]"#;

    #[test]
    fn matches_selector_big_endian() {
        let abi = assert_ok!(FunctionAbi::deserialize(
            TRANSFER_ABI,
            &2608902224u32.to_be_bytes(),
            false
        ));
        assert_eq!(abi.name, "transfer");
        assert_eq!(abi.flat_inputs, vec!["string", "string", "uint256"]);
        assert_eq!(abi.conflict_fields.len(), 2);
        assert_eq!(abi.conflict_fields[1].value, vec![1]);
        assert_eq!(abi.conflict_fields[1].kind, ConflictFieldKind::Var);
    }

    #[test]
    fn view_functions_never_match() {
        assert_matches!(
            FunctionAbi::deserialize(TRANSFER_ABI, &904814471u32.to_be_bytes(), false),
            Err(AbiError::NoMatchingFunction(904814471))
        );
    }

    #[test]
    fn sm_scheme_uses_second_encoding() {
        let abi = r#"[{"conflictFields":[{"kind":0,"value":[],"slot":0}],"inputs":[],"name":"set","selector":[1,2],"type":"function"}]"#;
        assert_matches!(
            FunctionAbi::deserialize(abi, &1u32.to_be_bytes(), true),
            Err(AbiError::NoMatchingFunction(1))
        );
        let parsed = assert_ok!(FunctionAbi::deserialize(abi, &2u32.to_be_bytes(), true));
        assert_eq!(parsed.conflict_fields[0].kind, ConflictFieldKind::All);
    }

    #[test]
    fn keccak_selector_matches_declared_one() {
        assert_eq!(
            keccak_selector("transfer(string,string,uint256)"),
            2608902224
        );
    }

    #[test]
    fn missing_selector_is_recomputed_for_keccak() {
        let abi = r#"[{"conflictFields":[{"kind":5,"value":[]}],"inputs":[{"name":"from","type":"string"},{"name":"to","type":"string"},{"name":"num","type":"uint256"}],"name":"transfer","type":"function"}]"#;
        let parsed = assert_ok!(FunctionAbi::deserialize(
            abi,
            &keccak_selector("transfer(string,string,uint256)").to_be_bytes(),
            false
        ));
        assert_eq!(parsed.signature(), "transfer(string,string,uint256)");
        assert_eq!(parsed.conflict_fields[0].slot, None);
    }

    #[test]
    fn rejects_bad_conflict_fields() {
        let unknown_kind = r#"[{"conflictFields":[{"kind":9,"value":[]}],"inputs":[],"name":"f","selector":[7,7],"type":"function"}]"#;
        assert_matches!(
            FunctionAbi::deserialize(unknown_kind, &7u32.to_be_bytes(), false),
            Err(AbiError::UnknownConflictKind { kind: 9, .. })
        );
        let bad_env = r#"[{"conflictFields":[{"kind":2,"value":[9]}],"inputs":[],"name":"f","selector":[7,7],"type":"function"}]"#;
        assert_matches!(
            FunctionAbi::deserialize(bad_env, &7u32.to_be_bytes(), false),
            Err(AbiError::InvalidConflictField { .. })
        );
        assert_matches!(
            FunctionAbi::deserialize("{not json", &7u32.to_be_bytes(), false),
            Err(AbiError::Json(_))
        );
        assert_matches!(
            FunctionAbi::deserialize(TRANSFER_ABI, &[1, 2], false),
            Err(AbiError::ShortCallData(2))
        );
    }

    #[test]
    fn tuple_types_are_canonicalized() {
        let parameter = ParameterAbi {
            name: "order".to_string(),
            type_name: "tuple[]".to_string(),
            components: vec![
                ParameterAbi {
                    name: "id".to_string(),
                    type_name: "uint64".to_string(),
                    components: vec![],
                },
                ParameterAbi {
                    name: "owner".to_string(),
                    type_name: "address".to_string(),
                    components: vec![],
                },
            ],
        };
        assert_eq!(parameter.canonical_type(), "(uint64,address)[]");
    }
}
