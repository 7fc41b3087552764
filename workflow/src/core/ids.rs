//! Run identifier format and validation.

use chrono::{DateTime, Utc};

/// Longest accepted run id. Ids become checkpoint file names.
pub const MAX_RUN_ID_LEN: usize = 128;

/// Format a run id from a creation time and a random suffix.
///
/// Ids sort chronologically: `run-20260223-045210-1a2b3c4d`.
pub fn format_run_id(now: DateTime<Utc>, suffix: u32) -> String {
    format!("run-{}-{suffix:08x}", now.format("%Y%m%d-%H%M%S"))
}

/// Validate a caller-supplied run id.
///
/// Allowed: ASCII alphanumerics, `-`, `_` and `.`; must not start with `.`.
pub fn validate_run_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("run id must not be empty".to_string());
    }
    if id.len() > MAX_RUN_ID_LEN {
        return Err(format!(
            "run id '{id}' is longer than {MAX_RUN_ID_LEN} characters"
        ));
    }
    if id.starts_with('.') {
        return Err(format!("run id '{id}' must not start with '.'"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("run id '{id}' contains invalid character '{bad}'"));
    }
    Ok(())
}
