//! Textual decimal coercion
//!
//! Several record fields travel as decimal strings. The text must be a plain
//! or scientific decimal literal; it then converts to the nearest `f64`, so
//! magnitudes well outside any fixed-point range survive aggregation.

use crate::errors::DecodeError;

/// Parse a required textual decimal field.
///
/// Surrounding whitespace is ignored. Empty, non-numeric, or non-finite
/// text (`NaN`, `inf`, `1e400`) is a `CoercionError`.
pub fn parse_decimal(field: &'static str, text: &str) -> Result<f64, DecodeError> {
    let trimmed = text.trim();
    let coercion_error = || DecodeError::CoercionError {
        field,
        value: text.to_string(),
    };

    if !is_decimal_literal(trimmed) {
        return Err(coercion_error());
    }

    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(coercion_error)
}

/// `[+-]digits[.digits][(e|E)[+-]digits]`, with digits required on at least
/// one side of the point.
fn is_decimal_literal(text: &str) -> bool {
    fn digits(bytes: &[u8]) -> usize {
        bytes.iter().take_while(|b| b.is_ascii_digit()).count()
    }

    let bytes = text.as_bytes();
    let mut at = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));

    let int_digits = digits(&bytes[at..]);
    at += int_digits;
    let mut frac_digits = 0;
    if bytes.get(at) == Some(&b'.') {
        at += 1;
        frac_digits = digits(&bytes[at..]);
        at += frac_digits;
    }
    if int_digits + frac_digits == 0 {
        return false;
    }

    if matches!(bytes.get(at), Some(b'e' | b'E')) {
        at += 1;
        if matches!(bytes.get(at), Some(b'+' | b'-')) {
            at += 1;
        }
        let exp_digits = digits(&bytes[at..]);
        if exp_digits == 0 {
            return false;
        }
        at += exp_digits;
    }

    at == bytes.len()
}

/// Parse a nullable textual decimal field.
///
/// Absent and blank values decode to `None`, never to zero.
pub fn parse_optional_decimal(
    field: &'static str,
    text: Option<&str>,
) -> Result<Option<f64>, DecodeError> {
    match text {
        None => Ok(None),
        Some(t) if t.trim().is_empty() => Ok(None),
        Some(t) => parse_decimal(field, t).map(Some),
    }
}
