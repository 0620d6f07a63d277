//! Fixed-point representation of decimal values.
//!
//! Price and numeric attribute indexes store values as `i64` scaled by
//! `10^indexed_decimal_places`. Filtering must compare in that same
//! representation, otherwise a bound like `19.999` could disagree with the
//! index about equality or ordering.
//!
//! Rounding: digits beyond the indexed precision are rounded half away from
//! zero (`1.005` at 2 places is `101`, `-1.005` is `-101`).

use thiserror::Error;

/// The largest supported number of decimal places (`10^18` still fits `i64`).
pub const MAX_DECIMAL_PLACES: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixedPointError {
    #[error("empty decimal literal")]
    Empty,
    #[error("malformed decimal literal `{0}`")]
    Malformed(String),
    #[error("decimal literal `{0}` does not fit the fixed-point range")]
    Overflow(String),
    #[error("unsupported number of decimal places {0} (max {MAX_DECIMAL_PLACES})")]
    UnsupportedPlaces(u32),
}

/// Convert a decimal literal (`"12"`, `"-3.5"`, `"+0.125"`) into its
/// fixed-point integer at `places` decimal places.
pub fn to_fixed_point(value: &str, places: u32) -> Result<i64, FixedPointError> {
    if places > MAX_DECIMAL_PLACES {
        return Err(FixedPointError::UnsupportedPlaces(places));
    }
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FixedPointError::Empty);
    }

    let (negative, unsigned) = match trimmed.as_bytes()[0] {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(FixedPointError::Malformed(value.to_string()));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(FixedPointError::Malformed(value.to_string()));
    }

    let overflow = || FixedPointError::Overflow(value.to_string());

    let mut magnitude: i128 = 0;
    for b in int_part.bytes() {
        magnitude = magnitude
            .checked_mul(10)
            .and_then(|m| m.checked_add(i128::from(b - b'0')))
            .ok_or_else(overflow)?;
        if magnitude > i128::from(i64::MAX) {
            return Err(overflow());
        }
    }

    let frac_bytes = frac_part.as_bytes();
    for i in 0..places as usize {
        let digit = frac_bytes.get(i).map(|b| i128::from(b - b'0')).unwrap_or(0);
        magnitude = magnitude * 10 + digit;
    }
    if let Some(next) = frac_bytes.get(places as usize) {
        if *next >= b'5' {
            magnitude += 1;
        }
    }

    let signed = if negative { -magnitude } else { magnitude };
    i64::try_from(signed).map_err(|_| overflow())
}

/// Render a fixed-point integer back to its decimal literal.
pub fn from_fixed_point(value: i64, places: u32) -> String {
    if places == 0 {
        return value.to_string();
    }
    let divisor = 10i128.pow(places);
    let v = i128::from(value);
    let sign = if v < 0 { "-" } else { "" };
    let abs = v.abs();
    format!(
        "{sign}{}.{:0width$}",
        abs / divisor,
        abs % divisor,
        width = places as usize
    )
}
