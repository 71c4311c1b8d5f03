//! Settlement orchestration.
//!
//! Drives one paid call from claim to result:
//!
//! 1. idempotency reservation (or replay of a cached response)
//! 2. quote lookup, expiry and status checks
//! 3. endpoint match between quote and call
//! 4. payment verification
//! 5. one atomic write recording the payment, consuming the quote and
//!    queueing the job
//! 6. synchronous job execution
//! 7. response assembly, cached under the idempotency key on success
//!
//! No in-process lock is held across the verifier call. Two settlements of
//! the same quote both read it as active, but only the first to commit step 5
//! finds the quote bytes unchanged; the other fails with `QuoteNotActive`.

use crate::executor::JobExecutor;
use crate::idempotency::IdempotencyGate;
use crate::state::{Reservation, StateError, StateStore};
use paycall_types::{
	current_timestamp, truncate_id, IdempotencyEntry, Job, JobStatus, PaycallRequest,
	PaycallResponse, Payment, PaymentStatus, QuoteStatus, Receipt,
};
use paycall_verifier::{
	RejectionReason, VerificationOutcome, VerificationRequest, VerifierService,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

/// Ways a settlement can fail.
#[derive(Debug, Error)]
pub enum SettlementError {
	/// A required field is missing or malformed.
	#[error("Invalid request: {0}")]
	InvalidRequest(String),
	/// No quote has the given id.
	#[error("Quote {0} not found")]
	QuoteNotFound(String),
	/// The quote's expiry has passed.
	#[error("Quote {0} has expired")]
	QuoteExpired(String),
	/// The quote was already used or expired by the sweeper.
	#[error("Quote {0} is no longer active")]
	QuoteNotActive(String),
	/// The call targets a different endpoint than the one quoted.
	#[error("Quote is for endpoint '{quoted}' but the request targets '{requested}'")]
	EndpointMismatch { quoted: String, requested: String },
	/// The verifier rejected the payment claim.
	#[error("Payment invalid: {message}")]
	PaymentInvalid {
		reason: RejectionReason,
		message: String,
	},
	/// The verifier could not judge the claim; the quote stays active.
	#[error("Verifier unavailable: {0}")]
	VerifierUnavailable(String),
	/// The quote is consumed; the failure is recorded on the job.
	#[error("Job execution failed: {message}")]
	JobExecutionFailed {
		message: String,
		job_id: String,
		payment_id: String,
	},
	/// Another request holds the idempotency key.
	#[error("A request with this idempotency key is already in progress")]
	RequestInProgress,
	/// Reading or writing state failed.
	#[error("Storage error: {0}")]
	Storage(String),
	/// An unexpected failure, such as a response that would not serialize.
	#[error("Internal error: {0}")]
	Internal(String),
}

impl From<StateError> for SettlementError {
	fn from(err: StateError) -> Self {
		SettlementError::Storage(err.to_string())
	}
}

/// A successful settlement's response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
	/// Serialized [`PaycallResponse`], identical on every replay.
	pub body: String,
	/// True when `body` came from the idempotency cache.
	pub replayed: bool,
}

impl Settlement {
	/// Parses `body` back into the response it was serialized from.
	pub fn response(&self) -> Result<PaycallResponse, serde_json::Error> {
		serde_json::from_str(&self.body)
	}
}

/// Turns a quote plus a payment claim into an executed job.
pub struct SettlementOrchestrator {
	state: Arc<StateStore>,
	verifier: Arc<VerifierService>,
	gate: Arc<IdempotencyGate>,
	executor: Arc<JobExecutor>,
}

impl SettlementOrchestrator {
	/// Creates a new orchestrator.
	///
	/// # Arguments
	///
	/// * `state` - Typed store for quotes, payments, jobs and idempotency entries
	/// * `verifier` - Service that judges payment claims
	/// * `gate` - Idempotency gate sharing `state`
	/// * `executor` - Runs the job queued by a successful settlement
	pub fn new(
		state: Arc<StateStore>,
		verifier: Arc<VerifierService>,
		gate: Arc<IdempotencyGate>,
		executor: Arc<JobExecutor>,
	) -> Self {
		Self {
			state,
			verifier,
			gate,
			executor,
		}
	}

	/// Settles a paid call.
	///
	/// With an idempotency key, a live completed entry is replayed before
	/// anything else is looked at, and a key still held by another request
	/// fails with `RequestInProgress`. Only successful settlements are cached.
	#[instrument(skip_all, fields(
		quote_id = %truncate_id(&request.quote_id),
		endpoint = %request.request.endpoint,
	))]
	pub async fn settle(
		&self,
		request: PaycallRequest,
		idempotency_key: Option<&str>,
	) -> Result<Settlement, SettlementError> {
		let Some(key) = idempotency_key else {
			let body = self.settle_once(request).await?;
			return Ok(Settlement {
				body,
				replayed: false,
			});
		};

		IdempotencyGate::validate_key(key).map_err(SettlementError::InvalidRequest)?;

		let held = match self.gate.reserve(key).await? {
			Reservation::Completed(body) => {
				tracing::info!("Replaying cached settlement");
				return Ok(Settlement {
					body,
					replayed: true,
				});
			},
			Reservation::InFlight => return Err(SettlementError::RequestInProgress),
			Reservation::Acquired(held) => held,
		};

		let result = self.settle_once(request).await;
		match &result {
			Ok(body) => {
				if let Err(e) = self.gate.store(&held, body.clone()).await {
					tracing::error!(error = %e, "Failed to cache settlement response");
					self.release(&held).await;
				}
			},
			Err(_) => self.release(&held).await,
		}

		result.map(|body| Settlement {
			body,
			replayed: false,
		})
	}

	/// Cached response for `key`, checked before the request body is parsed.
	pub async fn cached_response(&self, key: &str) -> Result<Option<String>, SettlementError> {
		IdempotencyGate::validate_key(key).map_err(SettlementError::InvalidRequest)?;
		Ok(self.gate.lookup(key).await?)
	}

	async fn release(&self, held: &IdempotencyEntry) {
		match self.gate.release(held).await {
			Ok(true) => {},
			Ok(false) => tracing::warn!("Idempotency reservation was taken over before release"),
			Err(e) => tracing::warn!(error = %e, "Failed to release idempotency reservation"),
		}
	}

	async fn settle_once(&self, request: PaycallRequest) -> Result<String, SettlementError> {
		let PaycallRequest {
			quote_id,
			payment_claim,
			request: call,
		} = request;

		if quote_id.trim().is_empty() {
			return Err(SettlementError::InvalidRequest(
				"quote_id must not be empty".into(),
			));
		}
		// Quotes store the trimmed endpoint.
		let endpoint = call.endpoint.trim();
		if endpoint.is_empty() {
			return Err(SettlementError::InvalidRequest(
				"request.endpoint must not be empty".into(),
			));
		}

		let snapshot = match self.state.quote(&quote_id).await {
			Ok(snapshot) => snapshot,
			Err(StateError::NotFound(_)) => return Err(SettlementError::QuoteNotFound(quote_id)),
			Err(e) => return Err(e.into()),
		};
		let quote = &snapshot.value;

		if quote.is_expired_at(current_timestamp()) {
			if quote.status == QuoteStatus::Active && self.state.expire_quote(&snapshot).await? {
				tracing::info!("Quote expired at settlement time");
			}
			return Err(SettlementError::QuoteExpired(quote_id));
		}
		if quote.status != QuoteStatus::Active {
			return Err(SettlementError::QuoteNotActive(quote_id));
		}

		if endpoint != quote.endpoint {
			return Err(SettlementError::EndpointMismatch {
				quoted: quote.endpoint.clone(),
				requested: endpoint.to_string(),
			});
		}

		let verification = VerificationRequest {
			quote_id: quote.id.clone(),
			expected_amount: quote.price_sats,
			receiver: quote.receiver.clone(),
			locator: quote.locator.clone(),
			claim: payment_claim.clone(),
		};
		let (settlement_ref, actual_amount) = match self
			.verifier
			.verify(&verification)
			.await
			.map_err(|e| SettlementError::VerifierUnavailable(e.to_string()))?
		{
			VerificationOutcome::Accepted {
				settlement_ref,
				actual_amount,
			} => (settlement_ref, actual_amount),
			VerificationOutcome::Rejected { reason, message } => {
				tracing::info!(reason = reason.as_str(), "Payment claim rejected");
				return Err(SettlementError::PaymentInvalid { reason, message });
			},
		};

		if actual_amount != quote.price_sats {
			tracing::warn!(
				quoted = quote.price_sats,
				settled = actual_amount,
				"Settled amount differs from quoted price"
			);
		}

		let now = current_timestamp();
		let payment = Payment {
			id: Uuid::new_v4().to_string(),
			quote_id: quote.id.clone(),
			sender: payment_claim.sender.clone(),
			amount_sats: actual_amount,
			settlement_ref,
			claim: payment_claim,
			status: PaymentStatus::Verified,
			created_at: now,
		};
		let job = Job {
			id: Uuid::new_v4().to_string(),
			payment_id: payment.id.clone(),
			endpoint: quote.endpoint.clone(),
			args: call.args,
			status: JobStatus::Queued,
			result: None,
			error: None,
			created_at: now,
			completed_at: None,
		};

		match self.state.consume_quote(&snapshot, &payment, &job).await {
			Ok(()) => {},
			Err(StateError::Conflict(_)) => {
				tracing::info!("Quote consumed by a concurrent settlement");
				return Err(SettlementError::QuoteNotActive(quote_id));
			},
			Err(e) => return Err(e.into()),
		}
		tracing::info!(
			payment_id = %truncate_id(&payment.id),
			job_id = %truncate_id(&job.id),
			"Payment recorded and quote consumed"
		);

		let job = self.executor.execute(&job.id).await?;

		if job.status != JobStatus::Completed {
			return Err(SettlementError::JobExecutionFailed {
				message: job
					.error
					.unwrap_or_else(|| "job did not complete".to_string()),
				job_id: job.id,
				payment_id: payment.id,
			});
		}

		let response = PaycallResponse {
			status: "ok".to_string(),
			result: job.result.unwrap_or(Value::Null),
			receipt: Receipt {
				settlement_ref: payment.settlement_ref,
				paid_amount: payment.amount_sats,
				job_id: job.id,
				payment_id: payment.id,
			},
		};
		serde_json::to_string(&response).map_err(|e| SettlementError::Internal(e.to_string()))
	}
}
