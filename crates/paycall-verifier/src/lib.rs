//! Payment verification module for the paycall system.
//!
//! The settlement pipeline never inspects payment claims itself. It hands the
//! claim, the quoted price and the payee to a [`VerifierInterface`]
//! implementation and acts on the outcome, so a verifier backed by a real
//! settlement network can replace the reference one without touching the
//! orchestrator.

use async_trait::async_trait;
use paycall_types::{ConfigSchema, ImplementationRegistry, PaymentClaim, VerifierHealth};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod structural;
}

/// Errors that can occur while talking to a verifier.
///
/// A rejected claim is not an error; it is reported as
/// [`VerificationOutcome::Rejected`].
#[derive(Debug, Error)]
pub enum VerifierError {
	/// The settlement network could not be reached or answered garbage.
	#[error("Network error: {0}")]
	Network(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Machine-readable reason a claim was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
	/// The claim lacks a spend blob or proof.
	MissingPaymentData,
	/// The claim is present but malformed.
	InvalidPaymentFormat,
	/// The claim is well-formed but did not verify against the network.
	VerificationFailed,
}

impl RejectionReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			RejectionReason::MissingPaymentData => "missing_payment_data",
			RejectionReason::InvalidPaymentFormat => "invalid_payment_format",
			RejectionReason::VerificationFailed => "verification_failed",
		}
	}
}

/// Payee details a verifier checks claims against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementTarget {
	/// Identity that must receive payments.
	pub receiver: String,
	/// Settlement network locator.
	pub locator: String,
}

/// Everything a verifier needs to judge one claim.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRequest {
	pub quote_id: String,
	/// Quoted price in sats.
	pub expected_amount: u64,
	pub receiver: String,
	pub locator: String,
	pub claim: PaymentClaim,
}

/// Result of verifying a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
	Accepted {
		/// Opaque reference uniquely identifying the off-chain payment.
		settlement_ref: String,
		/// Amount actually settled.
		actual_amount: u64,
	},
	Rejected {
		reason: RejectionReason,
		message: String,
	},
}

impl VerificationOutcome {
	pub fn rejected(reason: RejectionReason, message: impl Into<String>) -> Self {
		VerificationOutcome::Rejected {
			reason,
			message: message.into(),
		}
	}
}

/// Trait defining the interface for payment verifiers.
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait VerifierInterface: Send + Sync {
	/// Receiver and locator quotes should direct payment to.
	fn target(&self) -> SettlementTarget;

	/// Returns the configuration schema for this verifier implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Hint about the current settlement round, if the network exposes one.
	async fn round_hint(&self) -> Result<Option<String>, VerifierError>;

	/// Judges a claim against the quoted price and payee.
	async fn verify(
		&self,
		request: &VerificationRequest,
	) -> Result<VerificationOutcome, VerifierError>;

	/// Checks that the settlement network is reachable.
	async fn health(&self) -> Result<(), VerifierError> {
		Ok(())
	}
}

/// Type alias for verifier factory functions.
pub type VerifierFactory = fn(&toml::Value) -> Result<Box<dyn VerifierInterface>, VerifierError>;

/// Registry trait for verifier implementations.
pub trait VerifierRegistry: ImplementationRegistry<Factory = VerifierFactory> {}

/// Get all registered verifier implementations as (name, factory) pairs.
pub fn get_all_implementations() -> Vec<(&'static str, VerifierFactory)> {
	use implementations::structural;

	vec![(structural::Registry::NAME, structural::Registry::factory())]
}

/// Service wrapping the configured verifier implementation.
pub struct VerifierService {
	name: String,
	implementation: Box<dyn VerifierInterface>,
}

impl VerifierService {
	pub fn new(name: impl Into<String>, implementation: Box<dyn VerifierInterface>) -> Self {
		Self {
			name: name.into(),
			implementation,
		}
	}

	/// Name of the implementation as configured.
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn target(&self) -> SettlementTarget {
		self.implementation.target()
	}

	/// Round hint, best-effort: failures are logged and reported as `None`.
	pub async fn round_hint(&self) -> Option<String> {
		match self.implementation.round_hint().await {
			Ok(hint) => hint,
			Err(e) => {
				tracing::warn!(verifier = %self.name, error = %e, "Failed to obtain round hint");
				None
			},
		}
	}

	pub async fn verify(
		&self,
		request: &VerificationRequest,
	) -> Result<VerificationOutcome, VerifierError> {
		self.implementation.verify(request).await
	}

	/// Health of the verifier and its network, in API form.
	pub async fn health(&self) -> VerifierHealth {
		let (healthy, message) = match self.implementation.health().await {
			Ok(()) => (true, None),
			Err(e) => (false, Some(e.to_string())),
		};
		VerifierHealth {
			name: self.name.clone(),
			healthy,
			round_hint: self.round_hint().await,
			message,
		}
	}
}
