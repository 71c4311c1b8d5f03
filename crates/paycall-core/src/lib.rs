//! Core settlement engine for the paycall system.
//!
//! Wires the state store, quote issuer, idempotency gate, job executor and
//! settlement orchestrator into a [`PaycallEngine`], together with the
//! background sweeper and startup recovery. The engine is built once by
//! [`PaycallBuilder`] and shared behind an `Arc` by the HTTP layer.

use paycall_config::Config;
use paycall_types::{HealthResponse, Job};
use paycall_verifier::VerifierService;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod builder;
pub mod executor;
pub mod idempotency;
pub mod quote;
pub mod recovery;
pub mod settlement;
pub mod state;
pub mod sweeper;

pub use builder::{BuilderError, PaycallBuilder, PaycallFactories};
pub use executor::JobExecutor;
pub use idempotency::IdempotencyGate;
pub use quote::{QuoteError, QuoteIssuer};
pub use recovery::{RecoveryError, RecoveryReport, RecoveryService};
pub use settlement::{Settlement, SettlementError, SettlementOrchestrator};
pub use state::{Reservation, StateError, StateStore};
pub use sweeper::{SweepReport, Sweeper};

/// The assembled settlement pipeline.
pub struct PaycallEngine {
	config: Config,
	state: Arc<StateStore>,
	verifier: Arc<VerifierService>,
	issuer: Arc<QuoteIssuer>,
	orchestrator: Arc<SettlementOrchestrator>,
	sweeper: Arc<Sweeper>,
	recovery: RecoveryService,
}

impl PaycallEngine {
	/// Configuration the engine was built from.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Quote issuance.
	pub fn quotes(&self) -> &QuoteIssuer {
		&self.issuer
	}

	/// Settlement of paid calls.
	pub fn settlement(&self) -> &SettlementOrchestrator {
		&self.orchestrator
	}

	/// Shared state store.
	pub fn state(&self) -> &Arc<StateStore> {
		&self.state
	}

	/// Persisted job record, for callers that lost a settlement response.
	pub async fn job(&self, job_id: &str) -> Result<Job, StateError> {
		self.state.job(job_id).await
	}

	/// Verifier health; `status` is "ok" or "degraded".
	pub async fn health(&self) -> HealthResponse {
		let verifier = self.verifier.health().await;
		HealthResponse {
			status: if verifier.healthy { "ok" } else { "degraded" }.to_string(),
			verifier,
		}
	}

	/// Repairs state left by an earlier run. Call once before serving.
	pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
		self.recovery.recover().await
	}

	/// Starts the background sweeper. It stops once `shutdown` flips to true.
	pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		let sweeper = self.sweeper.clone();
		tokio::spawn(async move { sweeper.run(shutdown).await })
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use paycall_config::ConfigBuilder;

	#[tokio::test]
	async fn test_engine_quote_then_settle() {
		let engine = PaycallBuilder::new(ConfigBuilder::new().build())
			.build(PaycallFactories::builtin())
			.unwrap();

		let quote = engine
			.quotes()
			.issue_quote(
				"generate_image",
				Some([("images".to_string(), 3.0)].into_iter().collect()),
			)
			.await
			.unwrap();
		assert_eq!(quote.price_sats, 150);

		let request: paycall_types::PaycallRequest = serde_json::from_value(serde_json::json!({
			"quote_id": quote.quote_id,
			"payment_claim": {
				"spend_blob": "c3BlbmQtYmxvYi0wMDAx",
				"proof": "cHJvb2Y=",
				"sender": "alice"
			},
			"request": {"endpoint": "generate_image", "args": {"prompt": "a fox", "count": 3}}
		}))
		.unwrap();

		let settlement = engine.settlement().settle(request, None).await.unwrap();
		let response = settlement.response().unwrap();
		assert_eq!(response.receipt.paid_amount, 150);
		assert_eq!(response.result["images"].as_array().unwrap().len(), 3);

		let job = engine.job(&response.receipt.job_id).await.unwrap();
		assert_eq!(job.status, paycall_types::JobStatus::Completed);
	}

	#[tokio::test]
	async fn test_health_reports_verifier() {
		let engine = PaycallBuilder::new(ConfigBuilder::new().build())
			.build(PaycallFactories::builtin())
			.unwrap();
		let health = engine.health().await;
		assert_eq!(health.status, "ok");
		assert_eq!(health.verifier.name, "structural");
		assert!(health.verifier.healthy);
	}

	#[tokio::test]
	async fn test_sweeper_task_stops() {
		let engine = PaycallBuilder::new(ConfigBuilder::new().build())
			.build(PaycallFactories::builtin())
			.unwrap();
		let (tx, rx) = watch::channel(false);
		let handle = engine.spawn_sweeper(rx);
		tx.send(true).unwrap();
		tokio::time::timeout(std::time::Duration::from_secs(1), handle)
			.await
			.unwrap()
			.unwrap();
	}
}
