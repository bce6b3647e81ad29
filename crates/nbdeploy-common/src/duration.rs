//! Human-friendly durations for flags and deploy files
//!
//! Accepts `Nms`, `Ns`, `Nm` and `Nh`. A bare number is read as seconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::{Error, Result};

/// Parse a human-friendly duration string.
///
/// Examples: "250ms", "5s", "15m", "1h", "30" (seconds).
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || Error::validation(format!("invalid duration: {}", s));

    if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.trim().parse().map_err(|_| invalid())?;
        Ok(Duration::from_millis(n))
    } else if let Some(hours) = s.strip_suffix('h') {
        let n: u64 = hours.trim().parse().map_err(|_| invalid())?;
        Ok(Duration::from_secs(n * 3600))
    } else if let Some(minutes) = s.strip_suffix('m') {
        let n: u64 = minutes.trim().parse().map_err(|_| invalid())?;
        Ok(Duration::from_secs(n * 60))
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: u64 = secs.trim().parse().map_err(|_| invalid())?;
        Ok(Duration::from_secs(n))
    } else {
        s.parse().map(Duration::from_secs).map_err(|_| {
            Error::validation(format!(
                "invalid duration '{}', expected e.g. 500ms, 5s, 15m, 1h",
                s
            ))
        })
    }
}

/// Format a duration compactly for progress output (e.g. "2m05s", "4.2s")
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else if secs >= 10 {
        format!("{}s", secs)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Serde helper for optional duration strings in deploy files
pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}
