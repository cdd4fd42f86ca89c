//! Human-readable duration strings (`"500ms"`, `"30s"`, `"5m"`, `"1h"`).

use std::time::Duration;

use crate::error::{KeelError, KeelResult};

/// Parse a duration string. A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> KeelResult<Duration> {
    let s = s.trim();
    let invalid = || KeelError::Config(format!("invalid duration: {s:?}"));

    let (digits, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}
