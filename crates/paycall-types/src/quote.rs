//! Quote records.
//!
//! A quote is a priced authorization for one call to an endpoint. Its price is
//! fixed when it is issued and it can be consumed at most once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unit-kind ("tokens", "images", ...) to requested quantity.
///
/// Ordered so that serialized quotes are stable byte-for-byte.
pub type UnitCounts = BTreeMap<String, f64>;

/// Lifecycle status of a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
	Active,
	Expired,
	Used,
}

impl QuoteStatus {
	/// Quotes only ever leave `Active`; `Expired` and `Used` are terminal.
	pub fn can_transition_to(self, next: QuoteStatus) -> bool {
		matches!(
			(self, next),
			(QuoteStatus::Active, QuoteStatus::Expired) | (QuoteStatus::Active, QuoteStatus::Used)
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			QuoteStatus::Active => "active",
			QuoteStatus::Expired => "expired",
			QuoteStatus::Used => "used",
		}
	}
}

/// A persisted quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
	/// Opaque unique identifier.
	pub id: String,
	/// Endpoint the quote authorizes.
	pub endpoint: String,
	/// Unit counts the price was computed from.
	pub units: UnitCounts,
	/// Price in the smallest currency unit.
	pub price_sats: u64,
	/// Instant after which the quote can no longer be settled.
	pub expires_at: DateTime<Utc>,
	/// Single-use nonce, globally unique.
	pub nonce: String,
	/// Identity that must receive the payment.
	pub receiver: String,
	/// Settlement network locator payments are addressed to.
	pub locator: String,
	/// Current lifecycle status.
	pub status: QuoteStatus,
	/// Creation time.
	pub created_at: DateTime<Utc>,
}

impl Quote {
	/// Returns true once `now` is past the quote's expiry.
	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		now > self.expires_at
	}
}
