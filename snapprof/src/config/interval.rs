//! Interval string parsing
//!
//! Accepts a sequence of decimal numbers, each with an optional fraction and
//! a unit suffix: `15s`, `1h30m`, `1.5s`, `300ms`, `250us`. Valid units are
//! `ns`, `us` (or `µs`/`μs`), `ms`, `s`, `m`, `h`.

use std::time::Duration;

use crate::domain::IntervalError;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parse an interval string into a strictly positive [`Duration`].
///
/// # Errors
/// Returns an [`IntervalError`] when the string does not follow the grammar
/// above, overflows, or describes a zero or negative span.
pub fn parse_interval(input: &str) -> Result<Duration, IntervalError> {
    let mut rest = input;
    let mut negative = false;
    if let Some(r) = rest.strip_prefix('-') {
        negative = true;
        rest = r;
    } else if let Some(r) = rest.strip_prefix('+') {
        rest = r;
    }

    if rest == "0" {
        return Err(IntervalError::NotPositive(input.to_string()));
    }
    if rest.is_empty() {
        return Err(IntervalError::Malformed(input.to_string()));
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_digits, mut after) = rest.split_at(int_len);

        let mut frac_digits = "";
        if let Some(r) = after.strip_prefix('.') {
            let frac_len = r.bytes().take_while(u8::is_ascii_digit).count();
            (frac_digits, after) = r.split_at(frac_len);
        }
        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(IntervalError::Malformed(input.to_string()));
        }

        let unit_len = after.find(|c: char| c == '.' || c.is_ascii_digit()).unwrap_or(after.len());
        let (unit, next) = after.split_at(unit_len);
        let unit_nanos = unit_nanos(unit, input)?;

        let whole = accumulate_digits(int_digits)
            .and_then(|(v, _)| v.checked_mul(unit_nanos))
            .ok_or_else(|| IntervalError::Overflow(input.to_string()))?;

        // Digits past nanosecond precision cannot change the result
        let frac_digits = &frac_digits[..frac_digits.len().min(18)];
        let fraction = accumulate_digits(frac_digits)
            .map(|(v, scale)| v * unit_nanos / scale)
            .ok_or_else(|| IntervalError::Overflow(input.to_string()))?;

        total = total
            .checked_add(whole)
            .and_then(|t| t.checked_add(fraction))
            .ok_or_else(|| IntervalError::Overflow(input.to_string()))?;
        rest = next;
    }

    if negative || total == 0 {
        return Err(IntervalError::NotPositive(input.to_string()));
    }
    let nanos = u64::try_from(total).map_err(|_| IntervalError::Overflow(input.to_string()))?;
    Ok(Duration::from_nanos(nanos))
}

fn unit_nanos(unit: &str, input: &str) -> Result<u128, IntervalError> {
    match unit {
        "" => Err(IntervalError::MissingUnit(input.to_string())),
        "ns" => Ok(1),
        "us" | "µs" | "μs" => Ok(NANOS_PER_MICRO),
        "ms" => Ok(NANOS_PER_MILLI),
        "s" => Ok(NANOS_PER_SEC),
        "m" => Ok(60 * NANOS_PER_SEC),
        "h" => Ok(3600 * NANOS_PER_SEC),
        other => Err(IntervalError::UnknownUnit {
            unit: other.to_string(),
            input: input.to_string(),
        }),
    }
}

/// Fold ASCII digits into `(value, 10^len)`, `None` on overflow
fn accumulate_digits(digits: &str) -> Option<(u128, u128)> {
    digits.bytes().try_fold((0u128, 1u128), |(value, scale), b| {
        let value = value.checked_mul(10)?.checked_add(u128::from(b - b'0'))?;
        Some((value, scale.checked_mul(10)?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_units() {
        assert_eq!(parse_interval("15s"), Ok(Duration::from_secs(15)));
        assert_eq!(parse_interval("50ms"), Ok(Duration::from_millis(50)));
        assert_eq!(parse_interval("250us"), Ok(Duration::from_micros(250)));
        assert_eq!(parse_interval("250µs"), Ok(Duration::from_micros(250)));
        assert_eq!(parse_interval("10ns"), Ok(Duration::from_nanos(10)));
        assert_eq!(parse_interval("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_interval("1h"), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn test_compound_and_fraction() {
        assert_eq!(parse_interval("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_interval("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_interval(".5s"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_interval("1m0.25s"), Ok(Duration::from_millis(60_250)));
        assert_eq!(parse_interval("+3s"), Ok(Duration::from_secs(3)));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(parse_interval("banana"), Err(IntervalError::Malformed(_))));
        assert!(matches!(parse_interval(""), Err(IntervalError::Malformed(_))));
        assert!(matches!(parse_interval(".s"), Err(IntervalError::Malformed(_))));
        assert!(matches!(parse_interval("15"), Err(IntervalError::MissingUnit(_))));
        assert!(matches!(parse_interval("3d"), Err(IntervalError::UnknownUnit { .. })));
    }

    #[test]
    fn test_not_positive() {
        assert!(matches!(parse_interval("0"), Err(IntervalError::NotPositive(_))));
        assert!(matches!(parse_interval("0s"), Err(IntervalError::NotPositive(_))));
        assert!(matches!(parse_interval("-1s"), Err(IntervalError::NotPositive(_))));
    }

    #[test]
    fn test_overflow() {
        assert!(matches!(
            parse_interval("999999999999999999999h"),
            Err(IntervalError::Overflow(_))
        ));
    }
}
