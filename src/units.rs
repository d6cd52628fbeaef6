// src/units.rs
use ethers::types::{Bytes, U256};

use crate::error::FormatError;

/// Converts a decimal amount such as `"1.5"` into a fixed-point integer with
/// `decimals` fractional digits.
///
/// Fractional digits beyond `decimals` are truncated, never rounded. An empty
/// integer part (`".5"`) is read as zero.
pub fn to_fixed_point(value: &str, decimals: usize) -> Result<U256, FormatError> {
    let value = value.trim();
    let (int_part, frac_part) = value.split_once('.').unwrap_or((value, ""));

    let is_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !is_digits(int_part) || !is_digits(frac_part) || (int_part.is_empty() && frac_part.is_empty())
    {
        return Err(FormatError::InvalidDecimal(value.to_string()));
    }

    let mut digits = String::with_capacity(int_part.len() + decimals + 1);
    digits.push_str(if int_part.is_empty() { "0" } else { int_part });
    digits.extend(frac_part.chars().take(decimals));
    let frac_len = frac_part.len().min(decimals);
    digits.extend(std::iter::repeat('0').take(decimals - frac_len));

    let trimmed = digits.trim_start_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    U256::from_dec_str(trimmed).map_err(|_| FormatError::Overflow(value.to_string()))
}

/// Parses a hex string with or without `0x`, left-padding odd-length input.
pub fn hex_to_bytes(value: &str) -> Result<Bytes, FormatError> {
    let trimmed = value.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let decoded = if stripped.len() % 2 == 1 {
        hex::decode(format!("0{stripped}"))
    } else {
        hex::decode(stripped)
    };
    decoded
        .map(Bytes::from)
        .map_err(|_| FormatError::InvalidHex(value.to_string()))
}
