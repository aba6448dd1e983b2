//! CLI to Config conversion utilities

use anyhow::{Context, Result};
use std::time::Duration;

/// Parse a duration string (e.g., "500ms", "60s", "5m", "1h"); bare numbers are seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, millis) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix("sec").or_else(|| s.strip_suffix('s')) {
        (n, 1000)
    } else if let Some(n) = s.strip_suffix("min").or_else(|| s.strip_suffix('m')) {
        (n, 60 * 1000)
    } else if let Some(n) = s.strip_suffix("hr").or_else(|| s.strip_suffix('h')) {
        (n, 3600 * 1000)
    } else {
        (s.as_str(), 1000)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    let total = num
        .checked_mul(millis)
        .with_context(|| format!("Duration too large: {}", s))?;
    Ok(Duration::from_millis(total))
}

/// Parse a duration string to whole milliseconds
pub fn parse_duration_ms(s: &str) -> Result<u64> {
    let duration = parse_duration(s)?;
    u64::try_from(duration.as_millis()).with_context(|| format!("Duration too large: {}", s))
}

/// Parse an operand size "ROWSxCOLS" (e.g., "1000x500")
pub fn parse_shape(s: &str) -> Result<(usize, usize)> {
    let lower = s.trim().to_lowercase();
    let (rows, cols) = lower
        .split_once('x')
        .with_context(|| format!("Invalid size {:?}; expected ROWSxCOLS", s))?;

    let rows: usize = rows
        .trim()
        .parse()
        .with_context(|| format!("Invalid row count in size {:?}", s))?;
    let cols: usize = cols
        .trim()
        .parse()
        .with_context(|| format!("Invalid column count in size {:?}", s))?;

    if rows == 0 || cols == 0 {
        anyhow::bail!("Size {:?} must have at least one row and one column", s);
    }
    Ok((rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("60sec").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration(" 10S ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms("2s").unwrap(), 2000);
        assert_eq!(parse_duration_ms("10m").unwrap(), 600_000);
    }

    #[test]
    fn test_parse_shape() {
        assert_eq!(parse_shape("1000x500").unwrap(), (1000, 500));
        assert_eq!(parse_shape("4X4").unwrap(), (4, 4));
        assert_eq!(parse_shape(" 3 x 7 ").unwrap(), (3, 7));
    }

    #[test]
    fn test_parse_shape_invalid() {
        assert!(parse_shape("1000").is_err());
        assert!(parse_shape("0x5").is_err());
        assert!(parse_shape("ax5").is_err());
        assert!(parse_shape("5x").is_err());
    }
}
