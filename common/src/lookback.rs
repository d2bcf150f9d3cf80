//! Parsing for lookback window specifications.
//!
//! Lookback windows are written as `<int><unit>` where the unit is one of
//! `s`, `m`, `h`, `d`, or `w`. The same grammar is accepted from the
//! `HISTORY_LOOKBACK` environment variable and from the `?lookback=` query
//! parameter on client connections.

use std::time::Duration;

use thiserror::Error;

/// Error parsing a lookback specification.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid lookback {0:?}, expected <int><s|m|h|d|w>")]
pub struct LookbackError(pub String);

/// Parses a `<int><s|m|h|d|w>` duration string.
pub fn parse_lookback(spec: &str) -> Result<Duration, LookbackError> {
    let spec = spec.trim();
    if spec.len() < 2 {
        return Err(LookbackError(spec.to_string()));
    }

    let (number, unit) = spec.split_at(spec.len() - 1);
    let value: u64 = number
        .parse()
        .map_err(|_| LookbackError(spec.to_string()))?;

    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        "d" => value * 86_400,
        "w" => value * 604_800,
        _ => return Err(LookbackError(spec.to_string())),
    };

    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_each_unit() {
        assert_eq!(parse_lookback("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_lookback("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_lookback("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_lookback("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_lookback("1w").unwrap(), Duration::from_secs(604_800));
    }

    #[test]
    fn should_trim_whitespace() {
        assert_eq!(parse_lookback(" 5m ").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn should_reject_missing_unit() {
        assert!(parse_lookback("15").is_err());
    }

    #[test]
    fn should_reject_unknown_unit() {
        assert!(parse_lookback("15x").is_err());
    }

    #[test]
    fn should_reject_empty_and_bare_unit() {
        assert!(parse_lookback("").is_err());
        assert!(parse_lookback("m").is_err());
    }

    #[test]
    fn should_reject_negative_values() {
        assert!(parse_lookback("-5m").is_err());
    }
}
