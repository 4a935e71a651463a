//! Byte-size handling for Kubernetes quantities ("10Gi", "1.5G", "512M").
//!
//! Only the non-negative forms used for storage sizes are supported.
//! Fractional byte counts round up.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),
    #[error("unknown suffix in quantity {0:?}")]
    UnknownSuffix(String),
    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Multiplier as a (numerator, denominator) pair.
fn multiplier(suffix: &str, raw: &str) -> Result<(i128, i128), QuantityError> {
    if suffix.is_empty() {
        return Ok((1, 1));
    }
    if suffix == "m" {
        return Ok((1, 1000));
    }
    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((1024i128.pow(*power), 1));
    }
    if let Some((_, power)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((1000i128.pow(*power), 1));
    }
    if let Some(exp) = suffix.strip_prefix(['e', 'E']) {
        let exp: u32 = exp
            .parse()
            .map_err(|_| QuantityError::UnknownSuffix(raw.to_string()))?;
        let value = 10i128
            .checked_pow(exp)
            .ok_or_else(|| QuantityError::OutOfRange(raw.to_string()))?;
        return Ok((value, 1));
    }
    Err(QuantityError::UnknownSuffix(raw.to_string()))
}

/// Parse a quantity into a number of bytes.
pub fn parse_bytes(raw: &str) -> Result<i64, QuantityError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(QuantityError::Empty);
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    if number.is_empty() {
        return Err(QuantityError::InvalidNumber(raw.to_string()));
    }

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if fraction.contains('.') || (whole.is_empty() && fraction.is_empty()) {
        return Err(QuantityError::InvalidNumber(raw.to_string()));
    }

    let digits = format!("{whole}{fraction}");
    let mantissa: i128 = digits
        .parse()
        .map_err(|_| QuantityError::OutOfRange(raw.to_string()))?;
    let scale = 10i128
        .checked_pow(fraction.len() as u32)
        .ok_or_else(|| QuantityError::OutOfRange(raw.to_string()))?;

    let (num, den) = multiplier(suffix, raw)?;
    let numerator = mantissa
        .checked_mul(num)
        .ok_or_else(|| QuantityError::OutOfRange(raw.to_string()))?;
    let denominator = scale * den;
    let bytes = (numerator + denominator - 1) / denominator;

    i64::try_from(bytes).map_err(|_| QuantityError::OutOfRange(raw.to_string()))
}

/// Render bytes with the largest binary suffix that divides them exactly.
pub fn format_bytes(bytes: i64) -> String {
    for (suffix, power) in BINARY_SUFFIXES.iter().rev() {
        let unit = 1024i64.pow(*power);
        if bytes != 0 && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}
