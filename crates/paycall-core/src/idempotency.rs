//! Idempotency gate.
//!
//! A caller-supplied key is reserved before a settlement runs. While the
//! reservation is pending, other requests with the same key are turned away;
//! once the settlement succeeds the serialized response replaces the
//! reservation and is replayed verbatim until the entry expires. A failed
//! settlement releases the key so a retry can run.

use crate::state::{Reservation, StateError, StateStore};
use paycall_types::{current_timestamp, IdempotencyEntry};
use std::sync::Arc;
use std::time::Duration;

/// Longest idempotency key accepted.
pub const MAX_KEY_LEN: usize = 255;

/// Reserves, completes and releases idempotency keys over the state store.
pub struct IdempotencyGate {
	state: Arc<StateStore>,
	ttl: Duration,
}

impl IdempotencyGate {
	/// Creates a gate whose entries live for `ttl`.
	pub fn new(state: Arc<StateStore>, ttl: Duration) -> Self {
		Self { state, ttl }
	}

	/// Rejects keys that are empty, too long or contain control characters.
	pub fn validate_key(key: &str) -> Result<(), String> {
		if key.trim().is_empty() {
			return Err("idempotency key must not be empty".into());
		}
		if key.len() > MAX_KEY_LEN {
			return Err(format!(
				"idempotency key must be at most {} bytes",
				MAX_KEY_LEN
			));
		}
		if key.chars().any(char::is_control) {
			return Err("idempotency key must not contain control characters".into());
		}
		Ok(())
	}

	/// Cached response for `key`, if a completed entry is still live.
	pub async fn lookup(&self, key: &str) -> Result<Option<String>, StateError> {
		let now = current_timestamp();
		Ok(self
			.state
			.idempotency_entry(key)
			.await?
			.map(|snapshot| snapshot.into_inner())
			.filter(|entry| !entry.is_expired_at(now))
			.and_then(|entry| entry.response))
	}

	/// Claims `key` for the calling request.
	///
	/// On [`Reservation::Acquired`] the caller must later pass the returned
	/// entry to either [`store`](Self::store) or [`release`](Self::release).
	pub async fn reserve(&self, key: &str) -> Result<Reservation, StateError> {
		self.state
			.reserve_idempotency(key, self.ttl, current_timestamp())
			.await
	}

	/// Replaces the reservation `held` with the final response.
	pub async fn store(&self, held: &IdempotencyEntry, response: String) -> Result<(), StateError> {
		self.state
			.complete_idempotency(held, response, self.ttl, current_timestamp())
			.await
	}

	/// Drops the reservation `held`; returns `false` if another request
	/// already owns the key.
	pub async fn release(&self, held: &IdempotencyEntry) -> Result<bool, StateError> {
		self.state.release_idempotency(held).await
	}

	/// Removes expired entries; returns how many.
	pub async fn purge_expired(&self) -> Result<usize, StateError> {
		self.state.purge_idempotency(current_timestamp()).await
	}
}
