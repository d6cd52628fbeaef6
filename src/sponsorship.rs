// src/sponsorship.rs
use ethers::types::{Address, U256};
use serde_json::{Map, Value};
use tracing::warn;

use crate::types::SponsorshipResult;
use crate::units::hex_to_bytes;

/// Keys a paymaster may nest its gas fields under, in lookup order. The
/// top-level object is consulted last.
const GAS_CONTAINERS: [&str; 2] = ["gas", "gasLimits"];

/// Reads a paymaster response into a [`SponsorshipResult`].
///
/// Accepts the bare result, or one level of `{result: ..}` / `{data: ..}`
/// wrapping. Values that are neither numeric strings nor integers are
/// dropped with a warning.
pub fn normalize(raw: &Value) -> SponsorshipResult {
    let source = ["result", "data"]
        .iter()
        .find_map(|key| raw.get(key).filter(|v| !v.is_null()))
        .unwrap_or(raw);
    let Some(source) = source.as_object() else {
        return SponsorshipResult::default();
    };

    let containers: Vec<&Map<String, Value>> = GAS_CONTAINERS
        .iter()
        .filter_map(|key| source.get(*key).and_then(Value::as_object))
        .chain(std::iter::once(source))
        .collect();
    let gas = |name: &str| {
        containers
            .iter()
            .find_map(|c| c.get(name).filter(|v| !v.is_null()))
            .and_then(|v| coerce_integer(name, v))
    };

    SponsorshipResult {
        paymaster: source
            .get("paymaster")
            .and_then(Value::as_str)
            .and_then(|s| parse_or_warn("paymaster", s, |s| s.parse::<Address>().ok())),
        paymaster_data: source
            .get("paymasterData")
            .and_then(Value::as_str)
            .and_then(|s| parse_or_warn("paymasterData", s, |s| hex_to_bytes(s).ok())),
        pre_verification_gas: gas("preVerificationGas"),
        verification_gas_limit: gas("verificationGasLimit"),
        call_gas_limit: gas("callGasLimit"),
        max_fee_per_gas: gas("maxFeePerGas"),
        max_priority_fee_per_gas: gas("maxPriorityFeePerGas"),
        paymaster_verification_gas_limit: gas("paymasterVerificationGasLimit"),
        paymaster_post_op_gas_limit: gas("paymasterPostOpGasLimit"),
    }
}

/// Hex (`0x`-prefixed) or decimal strings, and non-negative JSON integers.
fn coerce_integer(name: &str, value: &Value) -> Option<U256> {
    let parsed = match value {
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => U256::from_str_radix(hex, 16).ok(),
                None if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                    U256::from_dec_str(s).ok()
                }
                None => None,
            }
        }
        Value::Number(n) => {
            let parsed = n.as_u64().map(U256::from);
            if parsed.is_none() {
                // Unquoted integers beyond u64 arrive as floats and cannot be recovered exactly.
                warn!(
                    "Ignoring sponsorship field {}: {} is negative, fractional or out of range for an unquoted number",
                    name, n
                );
            }
            return parsed;
        }
        _ => None,
    };
    if parsed.is_none() {
        warn!("Ignoring non-numeric sponsorship field {}: {}", name, value);
    }
    parsed
}

fn parse_or_warn<T>(name: &str, raw: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(raw);
    if parsed.is_none() {
        warn!("Ignoring malformed sponsorship field {}: {}", name, raw);
    }
    parsed
}
