//! Idempotency cache records.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
	/// A request holding this key is in flight.
	Pending,
	/// The request finished and `response` holds its body.
	Completed,
}

/// Cached outcome of a request bearing an idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
	pub key: String,
	pub state: IdempotencyState,
	/// Serialized response body, replayed verbatim.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response: Option<String>,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
}

impl IdempotencyEntry {
	/// Reservation held while the first request bearing `key` runs.
	pub fn pending(key: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
		Self {
			key: key.to_string(),
			state: IdempotencyState::Pending,
			response: None,
			created_at: now,
			expires_at: expiry(now, ttl),
		}
	}

	pub fn completed(key: &str, response: String, now: DateTime<Utc>, ttl: Duration) -> Self {
		Self {
			key: key.to_string(),
			state: IdempotencyState::Completed,
			response: Some(response),
			created_at: now,
			expires_at: expiry(now, ttl),
		}
	}

	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
	TimeDelta::from_std(ttl)
		.ok()
		.and_then(|delta| now.checked_add_signed(delta))
		.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_entry_expires_after_ttl() {
		let now = Utc::now();
		let entry = IdempotencyEntry::pending("k", now, Duration::from_secs(120));
		assert!(!entry.is_expired_at(now + TimeDelta::seconds(119)));
		assert!(entry.is_expired_at(now + TimeDelta::seconds(120)));
	}

	#[test]
	fn test_pending_entry_omits_response() {
		let entry = IdempotencyEntry::pending("k", Utc::now(), Duration::from_secs(1));
		let json = serde_json::to_value(&entry).unwrap();
		assert_eq!(json["state"], "pending");
		assert!(json.get("response").is_none());
	}
}
