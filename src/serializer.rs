// src/serializer.rs
//! Wire encoding of a UserOperation for the paymaster backend.
//!
//! The backend decodes integers with a big-integer parser and byte arrays
//! from base64, so integers travel as base-10 digits and byte fields as
//! base64 (or an explicit `null` when empty).

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ethers::types::{Address, Bytes, U256};
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;

use crate::types::UserOperation;

/// Integer fields the paymaster expects as bare JSON numbers.
pub const NUMERIC_FIELDS: [&str; 8] = [
    "nonce",
    "callGasLimit",
    "verificationGasLimit",
    "preVerificationGas",
    "maxFeePerGas",
    "maxPriorityFeePerGas",
    "paymasterVerificationGasLimit",
    "paymasterPostOpGasLimit",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    pub sender: Address,
    pub nonce: String,
    pub call_data: Option<String>,
    pub call_gas_limit: String,
    pub verification_gas_limit: String,
    pub pre_verification_gas: String,
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    pub paymaster: Address,
    pub paymaster_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    pub factory_data: Option<String>,
    pub init_code: Option<String>,
}

/// Renders `op` in the paymaster wire format.
///
/// The signature is never included. Callers must have set the sender, nonce,
/// call data and the three base gas fields.
pub fn serialize(op: &UserOperation) -> WireOperation {
    let factory = op.effective_factory();
    let factory_data = op.factory_data.as_ref().filter(|d| !d.is_empty());
    // Both or neither.
    let (factory, factory_data) = match (factory, factory_data) {
        (Some(f), Some(d)) => (Some(f), Some(d.clone())),
        _ => (None, None),
    };

    WireOperation {
        sender: op.sender,
        nonce: decimal(op.nonce),
        call_data: encode_bytes(Some(&op.call_data)),
        call_gas_limit: decimal(op.call_gas_limit),
        verification_gas_limit: decimal(op.verification_gas_limit),
        pre_verification_gas: decimal(op.pre_verification_gas),
        max_fee_per_gas: decimal(op.max_fee_per_gas),
        max_priority_fee_per_gas: decimal(op.max_priority_fee_per_gas),
        paymaster: op.paymaster.unwrap_or_default(),
        paymaster_data: encode_bytes(op.paymaster_data.as_ref()),
        paymaster_verification_gas_limit: op.paymaster_verification_gas_limit.map(decimal),
        paymaster_post_op_gas_limit: op.paymaster_post_op_gas_limit.map(decimal),
        factory,
        factory_data: encode_bytes(factory_data.as_ref()),
        init_code: encode_bytes(op.derived_init_code().as_ref()),
    }
}

/// The JSON object sent as the first `pm_sponsorUserOperation` param, with
/// [`NUMERIC_FIELDS`] written as unquoted numbers.
pub fn paymaster_params(
    op: &WireOperation,
) -> Result<BTreeMap<String, Box<RawValue>>, serde_json::Error> {
    let Value::Object(fields) = serde_json::to_value(op)? else {
        return Err(serde::ser::Error::custom("operation did not encode to an object"));
    };

    fields
        .into_iter()
        .map(|(key, value)| {
            let raw = match &value {
                Value::String(digits)
                    if NUMERIC_FIELDS.contains(&key.as_str())
                        && !digits.is_empty()
                        && digits.bytes().all(|b| b.is_ascii_digit()) =>
                {
                    RawValue::from_string(digits.clone())?
                }
                _ => RawValue::from_string(value.to_string())?,
            };
            Ok((key, raw))
        })
        .collect()
}

fn decimal(value: U256) -> String {
    value.to_string()
}

fn encode_bytes(bytes: Option<&Bytes>) -> Option<String> {
    bytes.filter(|b| !b.is_empty()).map(|b| BASE64.encode(b))
}
