//! Startup recovery.
//!
//! Jobs run synchronously inside a settlement, so a job still `queued` or
//! `processing` at startup was interrupted by a crash. Such jobs are failed
//! rather than re-run: the caller never received a result and must settle
//! again with a fresh quote.
//!
//! Before looking at records, storage gets the chance to finish commits that
//! a crash interrupted after their commit point, so the payment, used quote
//! and queued job of one settlement appear together. Recovery then reports
//! used quotes without a payment and payments whose quote is not used. The
//! atomic consume write makes both impossible; they are logged, not repaired.

use crate::state::{StateError, StateStore};
use paycall_types::{truncate_id, JobStatus, QuoteStatus};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Error recorded on jobs failed by recovery.
pub const INTERRUPTED_JOB_ERROR: &str = "interrupted before completion";

/// Errors that can occur during startup recovery.
#[derive(Debug, Error)]
pub enum RecoveryError {
	#[error("State error: {0}")]
	State(#[from] StateError),
}

/// Report of the recovery operation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
	/// Storage commits finished after an interruption.
	pub replayed_commits: usize,
	/// Jobs moved to `failed` because they never finished.
	pub interrupted_jobs: usize,
	/// Ids of used quotes without a recorded payment.
	pub inconsistent_quotes: Vec<String>,
	/// Ids of payments whose quote is missing or not `used`.
	pub unconsumed_payments: Vec<String>,
}

/// Repairs and checks persisted state left by a previous run.
pub struct RecoveryService {
	state: Arc<StateStore>,
}

impl RecoveryService {
	pub fn new(state: Arc<StateStore>) -> Self {
		Self { state }
	}

	/// Must run before the service accepts settlements.
	#[instrument(skip_all)]
	pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
		let mut report = RecoveryReport {
			replayed_commits: self.state.recover_storage().await?,
			..RecoveryReport::default()
		};

		for job in self.state.jobs().await? {
			if job.status.is_terminal() {
				continue;
			}
			match self
				.state
				.transition_job(&job.id, JobStatus::Failed, |j| {
					j.error = Some(INTERRUPTED_JOB_ERROR.to_string())
				})
				.await
			{
				Ok(_) => {
					tracing::warn!(job_id = %truncate_id(&job.id), "Failed interrupted job");
					report.interrupted_jobs += 1;
				},
				Err(StateError::Conflict(_)) | Err(StateError::InvalidJobTransition { .. }) => {
					tracing::debug!(job_id = %truncate_id(&job.id), "Job changed during recovery");
				},
				Err(e) => return Err(e.into()),
			}
		}

		let quotes: HashMap<String, QuoteStatus> = self
			.state
			.quotes()
			.await?
			.into_iter()
			.map(|snapshot| (snapshot.value.id, snapshot.value.status))
			.collect();
		let payments = self.state.payments().await?;

		for payment in &payments {
			if quotes.get(&payment.quote_id) != Some(&QuoteStatus::Used) {
				tracing::error!(
					payment_id = %payment.id,
					quote_id = %payment.quote_id,
					"Payment recorded against a quote that was not consumed"
				);
				report.unconsumed_payments.push(payment.id.clone());
			}
		}
		report.unconsumed_payments.sort();

		for (quote_id, status) in &quotes {
			if *status == QuoteStatus::Used && !payments.iter().any(|p| &p.quote_id == quote_id) {
				tracing::error!(quote_id = %quote_id, "Used quote has no recorded payment");
				report.inconsistent_quotes.push(quote_id.clone());
			}
		}
		report.inconsistent_quotes.sort();

		tracing::info!(
			replayed_commits = report.replayed_commits,
			interrupted_jobs = report.interrupted_jobs,
			inconsistent_quotes = report.inconsistent_quotes.len(),
			unconsumed_payments = report.unconsumed_payments.len(),
			"Recovery finished"
		);
		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::{seed_queued_job, state_store};
	use paycall_storage::implementations::file::{FileStorage, TtlConfig};
	use paycall_storage::StorageService;
	use paycall_types::{
		current_timestamp, Payment, PaymentClaim, PaymentStatus, Quote, StorageKey,
	};
	use serde_json::json;
	use tempfile::TempDir;

	fn quote(id: &str, status: QuoteStatus) -> Quote {
		let now = current_timestamp();
		Quote {
			id: id.into(),
			endpoint: "compute".into(),
			units: Default::default(),
			price_sats: 1,
			expires_at: now,
			nonce: "n".into(),
			receiver: "r".into(),
			locator: "l".into(),
			status,
			created_at: now,
		}
	}

	fn payment(id: &str, quote_id: &str) -> Payment {
		Payment {
			id: id.into(),
			quote_id: quote_id.into(),
			sender: "alice".into(),
			amount_sats: 1,
			settlement_ref: "stl_1".into(),
			claim: PaymentClaim::default(),
			status: PaymentStatus::Verified,
			created_at: current_timestamp(),
		}
	}

	#[tokio::test]
	async fn test_unfinished_jobs_are_failed() {
		let state = Arc::new(state_store());
		seed_queued_job(&state, "queued", "compute", json!({})).await;
		seed_queued_job(&state, "running", "compute", json!({})).await;
		seed_queued_job(&state, "done", "compute", json!({})).await;
		state
			.transition_job("running", JobStatus::Processing, |_| {})
			.await
			.unwrap();
		state
			.transition_job("done", JobStatus::Processing, |_| {})
			.await
			.unwrap();
		state
			.transition_job("done", JobStatus::Completed, |j| j.result = Some(json!(1)))
			.await
			.unwrap();

		let report = RecoveryService::new(state.clone()).recover().await.unwrap();

		assert_eq!(report.interrupted_jobs, 2);
		for id in ["queued", "running"] {
			let job = state.job(id).await.unwrap();
			assert_eq!(job.status, JobStatus::Failed);
			assert_eq!(job.error.as_deref(), Some(INTERRUPTED_JOB_ERROR));
		}
		assert_eq!(state.job("done").await.unwrap().status, JobStatus::Completed);
	}

	#[tokio::test]
	async fn test_used_quote_without_payment_is_reported() {
		let state = Arc::new(state_store());
		let storage: &StorageService = state.storage();
		storage
			.store(
				StorageKey::Quotes.as_str(),
				"orphan",
				&quote("orphan", QuoteStatus::Used),
			)
			.await
			.unwrap();

		let report = RecoveryService::new(state).recover().await.unwrap();
		assert_eq!(report.inconsistent_quotes, vec!["orphan".to_string()]);
		assert_eq!(report.interrupted_jobs, 0);
	}

	#[tokio::test]
	async fn test_payment_on_active_quote_is_reported() {
		let state = Arc::new(state_store());
		let storage: &StorageService = state.storage();
		storage
			.store(StorageKey::Quotes.as_str(), "q1", &quote("q1", QuoteStatus::Active))
			.await
			.unwrap();
		storage
			.store(StorageKey::Payments.as_str(), "p1", &payment("p1", "q1"))
			.await
			.unwrap();

		let report = RecoveryService::new(state).recover().await.unwrap();
		assert_eq!(report.unconsumed_payments, vec!["p1".to_string()]);
		assert!(report.inconsistent_quotes.is_empty());
	}

	#[tokio::test]
	async fn test_interrupted_consume_is_completed_on_file_storage() {
		let dir = TempDir::new().unwrap();
		let open = || {
			Arc::new(StateStore::new(Arc::new(StorageService::new(Box::new(
				FileStorage::new(dir.path().to_path_buf(), TtlConfig::default()),
			)))))
		};

		let state = open();
		state
			.insert_quote(&quote("q1", QuoteStatus::Active))
			.await
			.unwrap();
		let snapshot = state.quote("q1").await.unwrap();
		seed_queued_job(&state, "j0", "compute", json!({})).await;
		let job = state.job("j0").await.unwrap();
		let job = paycall_types::Job {
			id: "j1".into(),
			payment_id: "p1".into(),
			..job
		};
		state
			.consume_quote(&snapshot, &payment("p1", "q1"), &job)
			.await
			.unwrap();

		// A clean commit leaves nothing to replay, and the records agree.
		let report = RecoveryService::new(open()).recover().await.unwrap();
		assert_eq!(report.replayed_commits, 0);
		assert!(report.unconsumed_payments.is_empty());
		assert!(report.inconsistent_quotes.is_empty());
		assert_eq!(report.interrupted_jobs, 2);
	}

	#[tokio::test]
	async fn test_clean_store_reports_nothing() {
		let report = RecoveryService::new(Arc::new(state_store()))
			.recover()
			.await
			.unwrap();
		assert_eq!(report, RecoveryReport::default());
	}
}
