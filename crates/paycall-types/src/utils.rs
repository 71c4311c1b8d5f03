//! Small helpers used for logging and timestamps.

use chrono::{DateTime, Utc};

/// Truncates an identifier for display purposes.
///
/// Shows only the first 8 characters followed by ".." for longer strings.
pub fn truncate_id(id: &str) -> String {
	match id.char_indices().nth(8) {
		Some((idx, _)) => format!("{}..", &id[..idx]),
		None => id.to_string(),
	}
}

/// Current wall-clock time in UTC.
pub fn current_timestamp() -> DateTime<Utc> {
	Utc::now()
}
