//! Quote issuance.

use crate::state::{StateError, StateStore};
use chrono::TimeDelta;
use paycall_pricing::{PricingError, PricingTable};
use paycall_types::{
	current_timestamp, truncate_id, Quote, QuoteResponse, QuoteStatus, SettlementInfo, UnitCounts,
};
use paycall_verifier::VerifierService;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

/// Errors that can occur while issuing a quote.
#[derive(Debug, Error)]
pub enum QuoteError {
	/// Unknown endpoint, empty endpoint or units the price table rejects.
	#[error("Invalid request: {0}")]
	InvalidRequest(String),
	/// The quote could not be persisted.
	#[error("State error: {0}")]
	State(#[from] StateError),
}

impl From<PricingError> for QuoteError {
	fn from(err: PricingError) -> Self {
		QuoteError::InvalidRequest(err.to_string())
	}
}

/// Prices calls and mints single-use quotes for them.
pub struct QuoteIssuer {
	state: Arc<StateStore>,
	pricing: Arc<PricingTable>,
	verifier: Arc<VerifierService>,
	ttl: Duration,
}

impl QuoteIssuer {
	/// Creates a new quote issuer.
	///
	/// # Arguments
	///
	/// * `state` - Store the issued quotes are persisted to
	/// * `pricing` - Per-endpoint price table
	/// * `verifier` - Supplies the receiver and locator payment is sent to
	/// * `ttl` - How long a quote stays payable
	pub fn new(
		state: Arc<StateStore>,
		pricing: Arc<PricingTable>,
		verifier: Arc<VerifierService>,
		ttl: Duration,
	) -> Self {
		Self {
			state,
			pricing,
			verifier,
			ttl,
		}
	}

	/// Prices `endpoint` for `units`, persists an active quote and returns
	/// where to send payment.
	///
	/// Missing unit counts fall back to the endpoint's default. The round
	/// hint is best-effort and never blocks issuance.
	#[instrument(skip_all, fields(endpoint = %endpoint))]
	pub async fn issue_quote(
		&self,
		endpoint: &str,
		units: Option<UnitCounts>,
	) -> Result<QuoteResponse, QuoteError> {
		let endpoint = endpoint.trim();
		if endpoint.is_empty() {
			return Err(QuoteError::InvalidRequest(
				"endpoint must not be empty".into(),
			));
		}

		let breakdown = self.pricing.price(endpoint, &units.unwrap_or_default())?;
		let target = self.verifier.target();
		let now = current_timestamp();
		let ttl = TimeDelta::from_std(self.ttl)
			.map_err(|e| QuoteError::InvalidRequest(format!("quote ttl out of range: {}", e)))?;

		let quote = Quote {
			id: Uuid::new_v4().to_string(),
			endpoint: endpoint.to_string(),
			units: breakdown.units,
			price_sats: breakdown.price_sats,
			expires_at: now + ttl,
			nonce: Uuid::new_v4().simple().to_string(),
			receiver: target.receiver,
			locator: target.locator,
			status: QuoteStatus::Active,
			created_at: now,
		};
		self.state.insert_quote(&quote).await?;

		tracing::info!(
			quote_id = %truncate_id(&quote.id),
			price_sats = quote.price_sats,
			"Issued quote"
		);

		let round_hint = self.verifier.round_hint().await;
		Ok(QuoteResponse {
			endpoint: quote.endpoint,
			units: quote.units,
			price_sats: quote.price_sats,
			expires_at: quote.expires_at,
			quote_id: quote.id,
			settlement: SettlementInfo {
				locator: quote.locator,
				receiver: quote.receiver,
				round_hint,
			},
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::{state_store, verifier_service};

	fn issuer(state: Arc<StateStore>) -> QuoteIssuer {
		QuoteIssuer::new(
			state,
			Arc::new(PricingTable::builtin()),
			Arc::new(verifier_service()),
			Duration::from_secs(30),
		)
	}

	#[tokio::test]
	async fn test_issue_quote_persists_active_quote() {
		let state = Arc::new(state_store());
		let issuer = issuer(state.clone());

		let units = UnitCounts::from([("tokens".to_string(), 1000.0)]);
		let response = issuer.issue_quote("summarize", Some(units)).await.unwrap();

		assert_eq!(response.price_sats, 50);
		assert_eq!(response.settlement.receiver, "npub1testreceiver");
		assert_eq!(response.settlement.round_hint.as_deref(), Some("round-7"));

		let stored = state.quote(&response.quote_id).await.unwrap().value;
		assert_eq!(stored.status, QuoteStatus::Active);
		assert_eq!(stored.price_sats, 50);
		assert_eq!(
			(stored.expires_at - stored.created_at).num_seconds(),
			30
		);
	}

	#[tokio::test]
	async fn test_default_units_are_filled_in() {
		let issuer = issuer(Arc::new(state_store()));
		let response = issuer.issue_quote("generate_image", None).await.unwrap();
		assert_eq!(response.units.get("images"), Some(&1.0));
		assert_eq!(response.price_sats, 50);
	}

	#[tokio::test]
	async fn test_nonces_and_ids_are_unique() {
		let state = Arc::new(state_store());
		let issuer = issuer(state.clone());
		let a = issuer.issue_quote("compute", None).await.unwrap();
		let b = issuer.issue_quote("compute", None).await.unwrap();
		assert_ne!(a.quote_id, b.quote_id);

		let qa = state.quote(&a.quote_id).await.unwrap().value;
		let qb = state.quote(&b.quote_id).await.unwrap().value;
		assert_ne!(qa.nonce, qb.nonce);
	}

	#[tokio::test]
	async fn test_empty_endpoint_rejected() {
		let issuer = issuer(Arc::new(state_store()));
		assert!(matches!(
			issuer.issue_quote("  ", None).await,
			Err(QuoteError::InvalidRequest(_))
		));
	}

	#[tokio::test]
	async fn test_negative_units_rejected() {
		let issuer = issuer(Arc::new(state_store()));
		let units = UnitCounts::from([("tokens".to_string(), -1.0)]);
		assert!(matches!(
			issuer.issue_quote("summarize", Some(units)).await,
			Err(QuoteError::InvalidRequest(_))
		));
	}
}
