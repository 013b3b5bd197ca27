//! Small shared helpers
//!
//! Workdir-key encoding and epoch timestamps used across the session and
//! server modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encode a working directory path into a workdir key by replacing `/`
/// with `-`. Two sessions sharing a raw session id are disambiguated by
/// this key.
pub fn encode_workdir(cwd: &str) -> String {
    cwd.replace('/', "-")
}

/// Best-effort inverse of [`encode_workdir`].
///
/// Not reversible when the original path contains `-`, but still useful
/// for deriving a likely path for externally-created sessions.
#[allow(dead_code)]
pub fn decode_workdir(key: &str) -> String {
    if !key.starts_with('-') {
        return key.to_string();
    }
    key.replace('-', "/")
}

/// Truncate `text` to at most `max` characters, appending an ellipsis
/// when shortened.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
