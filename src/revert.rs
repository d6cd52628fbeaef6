// src/revert.rs
//! Best-effort classification of EVM revert payloads into readable text.
//!
//! This is not a full ABI decoder: it recognises the two built-in Solidity
//! errors, a fixed table of ERC-20 and ERC-4337 custom errors, and as a
//! last resort treats mostly-printable payloads as plain text. Anything
//! else comes back as annotated hex.

use std::collections::BTreeMap;

use ethers::contract::EthError;
use ethers::types::U256;
use ethers::utils::format_units;
use serde::{Deserialize, Serialize};

use crate::contracts::{Erc20InsufficientAllowance, Erc20InsufficientBalance, PanicCode, RevertString};
use crate::units::hex_to_bytes;

const ERC20_INSUFFICIENT_BALANCE: [u8; 4] = [0xe4, 0x50, 0xd3, 0x8c];
const ERC20_INSUFFICIENT_ALLOWANCE: [u8; 4] = [0xfb, 0x8f, 0x41, 0xb2];

const CUSTOM_ERRORS: [([u8; 4], &str); 17] = [
    (ERC20_INSUFFICIENT_BALANCE, "ERC20InsufficientBalance"),
    (ERC20_INSUFFICIENT_ALLOWANCE, "ERC20InsufficientAllowance"),
    ([0x96, 0xc6, 0xfd, 0x1e], "ERC20InvalidSender"),
    ([0xec, 0x44, 0x2f, 0x05], "ERC20InvalidReceiver"),
    ([0xe6, 0x02, 0xdf, 0x05], "ERC20InvalidApprover"),
    ([0x94, 0x28, 0x0d, 0x62], "ERC20InvalidSpender"),
    ([0xaa, 0x10, 0x00, 0x0a], "Sender already constructed"),
    ([0xaa, 0x10, 0x00, 0x0b], "Create2 failed"),
    ([0xaa, 0x20, 0x00, 0x0a], "Account not deployed"),
    ([0xaa, 0x20, 0x00, 0x0b], "Invalid account"),
    ([0xaa, 0x30, 0x00, 0x0a], "Paymaster not deployed"),
    ([0xaa, 0x30, 0x00, 0x0b], "Paymaster deposit too low"),
    ([0xaa, 0x30, 0x00, 0x0c], "Paymaster validation failed"),
    ([0xaa, 0x40, 0x00, 0x0a], "Verification gas limit too low"),
    ([0xaa, 0x40, 0x00, 0x0b], "Invalid signature"),
    ([0xaa, 0x50, 0x00, 0x0a], "Gas too low"),
    ([0xaa, 0x90, 0x00, 0x0a], "Invalid aggregator"),
];

/// Amounts in ERC-20 errors are rendered assuming 18 decimals; the token's
/// real precision is not known at decode time.
const ASSUMED_DECIMALS: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertKind {
    StringError,
    Panic,
    CustomError,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedRevert {
    pub kind: RevertKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_fields: Option<BTreeMap<String, String>>,
}

impl DecodedRevert {
    fn new(kind: RevertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            structured_fields: None,
        }
    }
}

/// Human-readable reason for `data`. Empty for no data; never fails.
pub fn decode(data: Option<&[u8]>) -> String {
    decode_structured(data).message
}

/// Like [`decode`], for a hex string. Invalid hex yields a decode-error line.
pub fn decode_hex(data: &str) -> String {
    match hex_to_bytes(data) {
        Ok(bytes) => decode(Some(&bytes[..])),
        Err(_) => format!("Decode error: {data}"),
    }
}

pub fn decode_structured(data: Option<&[u8]>) -> DecodedRevert {
    let data = match data {
        Some(d) if !d.is_empty() => d,
        _ => return DecodedRevert::new(RevertKind::Unknown, ""),
    };

    if let Some(err) = RevertString::decode_with_selector(data) {
        return DecodedRevert::new(RevertKind::StringError, err.reason);
    }
    if let Some(panic) = PanicCode::decode_with_selector(data) {
        return DecodedRevert::new(RevertKind::Panic, format!("Panic: {}", panic_reason(panic.code)));
    }
    if let Some(custom) = decode_custom_error(data) {
        return custom;
    }
    if let Some(text) = printable_text(data) {
        return DecodedRevert::new(RevertKind::Unknown, text);
    }

    DecodedRevert::new(
        RevertKind::Unknown,
        format!("Raw bytes: 0x{} (length: {} bytes)", hex::encode(data), data.len()),
    )
}

fn panic_reason(code: U256) -> String {
    let known = match code.low_u64() {
        _ if code > U256::from(u64::MAX) => None,
        0x01 => Some("Assertion failed"),
        0x11 => Some("Arithmetic overflow/underflow"),
        0x12 => Some("Division by zero"),
        0x21 => Some("Invalid enum value"),
        0x22 => Some("Invalid storage byte array access"),
        0x31 => Some("Pop on empty array"),
        0x32 => Some("Array index out of bounds"),
        0x41 => Some("Out of memory"),
        0x51 => Some("Invalid function selector"),
        _ => None,
    };
    match known {
        Some(reason) => reason.to_string(),
        None => format!("Unknown panic code: 0x{code:x}"),
    }
}

fn decode_custom_error(data: &[u8]) -> Option<DecodedRevert> {
    let selector: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let (_, name) = CUSTOM_ERRORS.iter().find(|(s, _)| *s == selector)?;

    let decoded = match selector {
        ERC20_INSUFFICIENT_BALANCE => match Erc20InsufficientBalance::decode_with_selector(data) {
            Some(err) => erc20_shortfall(
                format!(
                    "ERC20: Insufficient balance. Sender {:?} has {} but needs {} tokens",
                    err.sender,
                    amount(err.balance),
                    amount(err.needed)
                ),
                [
                    ("sender", format!("{:?}", err.sender)),
                    ("balance", err.balance.to_string()),
                    ("needed", err.needed.to_string()),
                ],
            ),
            None => DecodedRevert::new(
                RevertKind::CustomError,
                "ERC20: Insufficient balance (decode error)",
            ),
        },
        ERC20_INSUFFICIENT_ALLOWANCE => {
            match Erc20InsufficientAllowance::decode_with_selector(data) {
                Some(err) => erc20_shortfall(
                    format!(
                        "ERC20: Insufficient allowance. Spender {:?} may spend {} but needs {} tokens",
                        err.spender,
                        amount(err.allowance),
                        amount(err.needed)
                    ),
                    [
                        ("spender", format!("{:?}", err.spender)),
                        ("allowance", err.allowance.to_string()),
                        ("needed", err.needed.to_string()),
                    ],
                ),
                None => DecodedRevert::new(
                    RevertKind::CustomError,
                    "ERC20: Insufficient allowance (decode error)",
                ),
            }
        }
        _ => DecodedRevert::new(RevertKind::CustomError, format!("Custom Error: {name}")),
    };
    Some(decoded)
}

fn erc20_shortfall(message: String, fields: [(&str, String); 3]) -> DecodedRevert {
    DecodedRevert {
        kind: RevertKind::CustomError,
        message,
        structured_fields: Some(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        ),
    }
}

fn amount(value: U256) -> String {
    format_units(value, ASSUMED_DECIMALS).unwrap_or_else(|_| value.to_string())
}

/// More than 80% printable ASCII, more than four printable bytes, and the
/// printable part reads like a sentence.
fn printable_text(data: &[u8]) -> Option<String> {
    let printable: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| (0x20..=0x7e).contains(b))
        .collect();
    if printable.len() <= 4 || printable.len() * 5 <= data.len() * 4 {
        return None;
    }

    let text = String::from_utf8(printable).ok()?;
    let sentence_like = text.len() > 3
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || " -_:.,!?()".contains(c));
    sentence_like.then_some(text)
}

#[cfg(test)]
mod tests {
    use ethers::abi::{encode, Token};
    use ethers::types::Address;

    use super::*;

    fn with_selector(selector: [u8; 4], args: &[Token]) -> Vec<u8> {
        let mut data = selector.to_vec();
        data.extend(encode(args));
        data
    }

    #[test]
    fn decodes_error_string() {
        let data = with_selector(
            [0x08, 0xc3, 0x79, 0xa0],
            &[Token::String("Insufficient funds".into())],
        );
        assert_eq!(decode(Some(&data[..])), "Insufficient funds");
        assert_eq!(decode_structured(Some(&data[..])).kind, RevertKind::StringError);
    }

    #[test]
    fn decodes_arithmetic_panic() {
        let data = with_selector([0x4e, 0x48, 0x7b, 0x71], &[Token::Uint(U256::from(0x11))]);
        let message = decode(Some(&data[..]));
        assert!(message.contains("overflow") || message.contains("underflow"));
    }

    #[test]
    fn unknown_panic_code_is_reported_in_hex() {
        let data = with_selector([0x4e, 0x48, 0x7b, 0x71], &[Token::Uint(U256::from(0x99))]);
        assert_eq!(decode(Some(&data[..])), "Panic: Unknown panic code: 0x99");
    }

    #[test]
    fn empty_input_is_empty_reason() {
        assert_eq!(decode(None), "");
        assert_eq!(decode(Some(&[][..])), "");
        assert_eq!(decode_hex("0x"), "");
    }

    #[test]
    fn invalid_hex_degrades_to_decode_error() {
        assert_eq!(decode_hex("0xnothex"), "Decode error: 0xnothex");
    }

    #[test]
    fn decodes_insufficient_balance_with_amounts() {
        let sender = Address::repeat_byte(0x42);
        let data = with_selector(
            ERC20_INSUFFICIENT_BALANCE,
            &[
                Token::Address(sender),
                Token::Uint(U256::exp10(18)),
                Token::Uint(U256::exp10(18) * 2),
            ],
        );
        let decoded = decode_structured(Some(&data[..]));
        assert_eq!(decoded.kind, RevertKind::CustomError);
        assert!(decoded.message.starts_with("ERC20: Insufficient balance."));
        assert!(decoded.message.contains("0x4242424242424242424242424242424242424242"));
        assert!(decoded.message.contains("has 1.000000000000000000"));
        assert!(decoded.message.contains("needs 2.000000000000000000"));
        let fields = decoded.structured_fields.unwrap();
        assert_eq!(fields["needed"], "2000000000000000000");
    }

    #[test]
    fn truncated_allowance_error_still_named() {
        let data = [&ERC20_INSUFFICIENT_ALLOWANCE[..], &[0u8; 8][..]].concat();
        assert_eq!(
            decode(Some(&data[..])),
            "ERC20: Insufficient allowance (decode error)"
        );
    }

    #[test]
    fn erc20_selectors_match_their_signatures() {
        let erc20: Vec<_> = CUSTOM_ERRORS.iter().filter(|(_, name)| name.starts_with("ERC20")).collect();
        assert_eq!(erc20.len(), 6);
        for (selector, name) in erc20 {
            let signature = match *name {
                "ERC20InsufficientBalance" | "ERC20InsufficientAllowance" => {
                    format!("{name}(address,uint256,uint256)")
                }
                _ => format!("{name}(address)"),
            };
            assert_eq!(*selector, ethers::utils::id(&signature), "{signature}");
        }
        assert_eq!(ERC20_INSUFFICIENT_BALANCE, Erc20InsufficientBalance::selector());
        assert_eq!(ERC20_INSUFFICIENT_ALLOWANCE, Erc20InsufficientAllowance::selector());
    }

    #[test]
    fn sender_and_spender_errors_are_named_correctly() {
        let spender = with_selector([0x94, 0x28, 0x0d, 0x62], &[Token::Address(Address::zero())]);
        assert_eq!(decode(Some(&spender[..])), "Custom Error: ERC20InvalidSpender");
        let sender = with_selector([0x96, 0xc6, 0xfd, 0x1e], &[Token::Address(Address::zero())]);
        assert_eq!(decode(Some(&sender[..])), "Custom Error: ERC20InvalidSender");
    }

    #[test]
    fn maps_account_abstraction_selectors() {
        let data = [0xaa, 0x30, 0x00, 0x0b, 0x00];
        assert_eq!(decode(Some(&data[..])), "Custom Error: Paymaster deposit too low");
    }

    #[test]
    fn readable_payload_is_returned_as_text() {
        assert_eq!(
            decode(Some(&b"transfer amount exceeds balance"[..])),
            "transfer amount exceeds balance"
        );
    }

    #[test]
    fn gibberish_falls_back_to_hex() {
        let data = b"P:%NipqYd";
        assert_eq!(
            decode(Some(&data[..])),
            format!("Raw bytes: 0x{} (length: 9 bytes)", hex::encode(data))
        );

        let binary = [0x01, 0x02, 0x03, 0xff, 0xfe];
        assert_eq!(decode(Some(&binary[..])), "Raw bytes: 0x010203fffe (length: 5 bytes)");
    }
}
