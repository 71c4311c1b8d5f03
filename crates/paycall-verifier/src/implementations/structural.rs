//! Structural payment verifier.
//!
//! Checks only the shape of a claim: spend blob and proof must be present, and
//! the spend blob must be a base64-alphabet string of a minimum length. It
//! performs no cryptographic or network verification and accepts every
//! well-formed claim at the quoted amount. Intended for development and as the
//! reference behavior a real settlement-network verifier replaces.

use crate::{
	RejectionReason, SettlementTarget, VerificationOutcome, VerificationRequest, VerifierError,
	VerifierFactory, VerifierInterface, VerifierRegistry,
};
use async_trait::async_trait;
use paycall_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError,
};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const DEFAULT_MIN_BLOB_LEN: usize = 16;

fn is_blob_char(c: char) -> bool {
	c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_')
}

/// Shape-only verifier.
pub struct StructuralVerifier {
	target: SettlementTarget,
	min_blob_len: usize,
	/// Fixed round hint; when unset the current Unix minute is used.
	round_hint: Option<String>,
}

impl StructuralVerifier {
	pub fn new(target: SettlementTarget, min_blob_len: usize, round_hint: Option<String>) -> Self {
		Self {
			target,
			min_blob_len,
			round_hint,
		}
	}

	/// Deterministic reference for a claim against a quote.
	fn settlement_ref(quote_id: &str, spend_blob: &str) -> String {
		let name = format!("{}:{}", quote_id, spend_blob);
		format!(
			"stl_{}",
			Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).simple()
		)
	}
}

#[async_trait]
impl VerifierInterface for StructuralVerifier {
	fn target(&self) -> SettlementTarget {
		self.target.clone()
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(StructuralVerifierSchema)
	}

	async fn round_hint(&self) -> Result<Option<String>, VerifierError> {
		if let Some(hint) = &self.round_hint {
			return Ok(Some(hint.clone()));
		}
		let minutes = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map_err(|e| VerifierError::Network(e.to_string()))?
			.as_secs()
			/ 60;
		Ok(Some(format!("round-{}", minutes)))
	}

	async fn verify(
		&self,
		request: &VerificationRequest,
	) -> Result<VerificationOutcome, VerifierError> {
		let claim = &request.claim;

		if claim.spend_blob.is_empty() || claim.proof.is_empty() {
			return Ok(VerificationOutcome::rejected(
				RejectionReason::MissingPaymentData,
				"spend_blob and proof are required",
			));
		}
		if claim.spend_blob.len() < self.min_blob_len {
			return Ok(VerificationOutcome::rejected(
				RejectionReason::InvalidPaymentFormat,
				format!("spend_blob shorter than {} characters", self.min_blob_len),
			));
		}
		if !claim.spend_blob.chars().all(is_blob_char) {
			return Ok(VerificationOutcome::rejected(
				RejectionReason::InvalidPaymentFormat,
				"spend_blob contains characters outside the base64 alphabet",
			));
		}

		tracing::debug!(
			quote_id = %request.quote_id,
			amount = request.expected_amount,
			"Claim passed structural checks"
		);
		Ok(VerificationOutcome::Accepted {
			settlement_ref: Self::settlement_ref(&request.quote_id, &claim.spend_blob),
			actual_amount: request.expected_amount,
		})
	}
}

/// Configuration schema for StructuralVerifier.
pub struct StructuralVerifierSchema;

impl ConfigSchema for StructuralVerifierSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let non_empty = |v: &toml::Value| match v.as_str() {
			Some(s) if !s.trim().is_empty() => Ok(()),
			_ => Err("must not be empty".to_string()),
		};
		Schema::new(
			vec![
				Field::new("receiver", FieldType::String).with_validator(non_empty),
				Field::new("locator", FieldType::String).with_validator(non_empty),
			],
			vec![
				Field::new(
					"min_blob_len",
					FieldType::Integer {
						min: Some(1),
						max: Some(4096),
					},
				),
				Field::new("round_hint", FieldType::String),
			],
		)
		.validate(config)
	}
}

/// Factory function to create a structural verifier from configuration.
///
/// Configuration parameters:
/// - `receiver`: payee identity (required)
/// - `locator`: settlement network locator (required)
/// - `min_blob_len`: minimum spend blob length (default: 16)
/// - `round_hint`: fixed round hint (default: current Unix minute)
pub fn create_verifier(config: &toml::Value) -> Result<Box<dyn VerifierInterface>, VerifierError> {
	StructuralVerifierSchema
		.validate(config)
		.map_err(|e| VerifierError::Configuration(e.to_string()))?;

	let get_str = |key: &str| config.get(key).and_then(|v| v.as_str()).map(str::to_string);
	let target = SettlementTarget {
		receiver: get_str("receiver").unwrap_or_default(),
		locator: get_str("locator").unwrap_or_default(),
	};
	let min_blob_len = config
		.get("min_blob_len")
		.and_then(|v| v.as_integer())
		.map(|v| v as usize)
		.unwrap_or(DEFAULT_MIN_BLOB_LEN);

	Ok(Box::new(StructuralVerifier::new(
		target,
		min_blob_len,
		get_str("round_hint"),
	)))
}

/// Registry for the structural verifier implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "structural";
	type Factory = VerifierFactory;

	fn factory() -> Self::Factory {
		create_verifier
	}
}

impl VerifierRegistry for Registry {}
