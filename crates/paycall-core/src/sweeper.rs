//! Background expiry sweep.
//!
//! Moves active quotes past their expiry to `expired`, purges expired
//! idempotency entries and lets the backend drop TTL-expired keys. It never
//! touches used quotes, payments or jobs. Request-path correctness does not
//! depend on it: settlement and lookups check expiry themselves.

use crate::idempotency::IdempotencyGate;
use crate::state::{StateError, StateStore};
use paycall_types::{current_timestamp, truncate_id, QuoteStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
	pub expired_quotes: usize,
	pub purged_idempotency: usize,
	pub backend_removed: usize,
}

/// Periodic expiry housekeeping.
pub struct Sweeper {
	state: Arc<StateStore>,
	gate: Arc<IdempotencyGate>,
	interval: Duration,
}

impl Sweeper {
	/// Creates a new sweeper.
	///
	/// # Arguments
	///
	/// * `state` - Store whose quotes are expired
	/// * `gate` - Idempotency gate whose stale entries are purged
	/// * `interval` - Time between passes in [`run`](Self::run)
	pub fn new(state: Arc<StateStore>, gate: Arc<IdempotencyGate>, interval: Duration) -> Self {
		Self {
			state,
			gate,
			interval,
		}
	}

	/// Runs one pass and reports what it changed.
	pub async fn sweep_once(&self) -> Result<SweepReport, StateError> {
		let now = current_timestamp();
		let mut report = SweepReport::default();

		for snapshot in self.state.quotes().await? {
			let quote = &snapshot.value;
			if quote.status != QuoteStatus::Active || !quote.is_expired_at(now) {
				continue;
			}
			// A false return means the quote was consumed since it was read.
			if self.state.expire_quote(&snapshot).await? {
				tracing::debug!(quote_id = %truncate_id(&quote.id), "Expired quote");
				report.expired_quotes += 1;
			}
		}

		report.purged_idempotency = self.gate.purge_expired().await?;
		report.backend_removed = self.state.storage().cleanup_expired().await?;
		Ok(report)
	}

	/// Sweeps every interval until `shutdown` flips to true or its sender is dropped.
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
		let mut interval = tokio::time::interval(self.interval);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = interval.tick() => {
					match self.sweep_once().await {
						Ok(report) if report != SweepReport::default() => {
							tracing::debug!(
								expired_quotes = report.expired_quotes,
								purged_idempotency = report.purged_idempotency,
								backend_removed = report.backend_removed,
								"Sweep finished"
							);
						}
						Ok(_) => {}
						Err(e) => tracing::warn!(error = %e, "Sweep failed"),
					}
				}
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						tracing::info!("Sweeper stopped");
						break;
					}
				}
			}
		}
	}
}
