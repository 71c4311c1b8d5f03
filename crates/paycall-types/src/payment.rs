//! Payment claims and recorded payments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied evidence of payment.
///
/// Missing fields deserialize as empty strings so that an incomplete claim is
/// reported by the verifier as `missing_payment_data` rather than failing body
/// parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentClaim {
	/// Encoded spend of the off-chain payment.
	#[serde(default)]
	pub spend_blob: String,
	/// Proof accompanying the spend.
	#[serde(default)]
	pub proof: String,
	/// Identity of the payer.
	#[serde(default)]
	pub sender: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
	Pending,
	Verified,
	Failed,
}

/// A payment recorded after the verifier accepted a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
	pub id: String,
	/// Quote this payment consumed.
	pub quote_id: String,
	pub sender: String,
	/// Amount the verifier reports as actually settled.
	pub amount_sats: u64,
	/// Opaque settlement reference returned by the verifier.
	pub settlement_ref: String,
	/// Raw claim, kept for audit.
	pub claim: PaymentClaim,
	pub status: PaymentStatus,
	pub created_at: DateTime<Utc>,
}
