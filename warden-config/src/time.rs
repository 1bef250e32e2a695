//! Duration option parsing.

use crate::{ConfigError, ConfigResult};

const A_SECOND_IN_MILLIS: u64 = 1000;
const A_MINUTE_IN_MILLIS: u64 = 60 * A_SECOND_IN_MILLIS;
const AN_HOUR_IN_MILLIS: u64 = 60 * A_MINUTE_IN_MILLIS;
const A_DAY_IN_MILLIS: u64 = 24 * AN_HOUR_IN_MILLIS;

/// Parses a duration option into milliseconds.
///
/// Accepted suffixes are `ms`, `s`, `m`, `h` and `d`; a bare number is
/// read as seconds. The magnitude must be all digits.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTimeUnit`] when the magnitude contains
/// non-digit characters or is empty.
pub fn parse_time_millis(option: &str) -> ConfigResult<u64> {
    let option = option.trim();

    let (magnitude, multiplier) = if let Some(number) = option.strip_suffix("ms") {
        (number, 1)
    } else if let Some(number) = option.strip_suffix('s') {
        (number, A_SECOND_IN_MILLIS)
    } else if let Some(number) = option.strip_suffix('m') {
        (number, A_MINUTE_IN_MILLIS)
    } else if let Some(number) = option.strip_suffix('h') {
        (number, AN_HOUR_IN_MILLIS)
    } else if let Some(number) = option.strip_suffix('d') {
        (number, A_DAY_IN_MILLIS)
    } else {
        (option, A_SECOND_IN_MILLIS)
    };

    if magnitude.is_empty() || !magnitude.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConfigError::InvalidTimeUnit {
            value: option.to_owned(),
        });
    }

    magnitude
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ConfigError::InvalidTimeUnit {
            value: option.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_table() {
        assert_eq!(parse_time_millis("250ms").unwrap(), 250);
        assert_eq!(parse_time_millis("5s").unwrap(), 5_000);
        assert_eq!(parse_time_millis("2m").unwrap(), 120_000);
        assert_eq!(parse_time_millis("1h").unwrap(), 3_600_000);
        assert_eq!(parse_time_millis("1d").unwrap(), 86_400_000);
    }

    #[test]
    fn bare_numbers_are_seconds() {
        assert_eq!(parse_time_millis("30").unwrap(), 30_000);
    }

    #[test]
    fn rejects_non_digit_magnitudes() {
        assert!(parse_time_millis("abc").is_err());
        assert!(parse_time_millis("1.5s").is_err());
        assert!(parse_time_millis("-4s").is_err());
        assert!(parse_time_millis("ms").is_err());
        assert!(parse_time_millis("").is_err());
    }
}
