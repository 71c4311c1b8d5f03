//! Persisted state of the settlement pipeline.
//!
//! [`StateStore`] is the only component that reads or writes quotes,
//! payments, jobs and idempotency entries. Every status change goes through
//! a compare-and-swap against the bytes that were read, so concurrent
//! writers can never both move a record out of the same state.

use chrono::{DateTime, Utc};
use paycall_storage::{Snapshot, StorageError, StorageService};
use paycall_types::{
	current_timestamp, IdempotencyEntry, IdempotencyState, Job, JobStatus, Payment, Quote,
	QuoteStatus, StorageKey,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during state management.
#[derive(Debug, Error)]
pub enum StateError {
	/// The storage backend failed or a record could not be decoded.
	#[error("Storage error: {0}")]
	Storage(String),
	/// No record exists under the requested id.
	#[error("Not found: {0}")]
	NotFound(String),
	/// The record changed since it was read.
	#[error("Conflict: {0}")]
	Conflict(String),
	/// The job's stored status does not allow the requested move.
	#[error("Invalid job transition from {from:?} to {to:?}")]
	InvalidJobTransition { from: JobStatus, to: JobStatus },
	/// The quote's stored status does not allow the requested move.
	#[error("Invalid quote transition from {from:?} to {to:?}")]
	InvalidQuoteTransition { from: QuoteStatus, to: QuoteStatus },
}

impl From<StorageError> for StateError {
	fn from(err: StorageError) -> Self {
		match err {
			StorageError::Conflict(msg) => StateError::Conflict(msg),
			other => StateError::Storage(other.to_string()),
		}
	}
}

/// Result of trying to reserve an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
	/// The caller now holds the key. The entry is the exact pending record
	/// that was written; completing or releasing the key is conditional on
	/// it still being in place.
	Acquired(IdempotencyEntry),
	/// Another request holds the key and has not finished.
	InFlight,
	/// A previous request finished; its serialized response.
	Completed(String),
}

/// Typed access to the four record kinds.
pub struct StateStore {
	storage: Arc<StorageService>,
}

impl StateStore {
	/// Creates a state store over `storage`.
	///
	/// # Arguments
	///
	/// * `storage` - Storage service holding every namespace
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// The underlying storage service, for backend-level housekeeping.
	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	/// Persists a freshly issued quote. Fails with `Conflict` if the id is taken.
	pub async fn insert_quote(&self, quote: &Quote) -> Result<(), StateError> {
		self.storage
			.transaction()
			.expect_absent(StorageKey::Quotes.as_str(), &quote.id)
			.put(StorageKey::Quotes.as_str(), &quote.id, quote, None)?
			.commit()
			.await?;
		Ok(())
	}

	/// Loads a quote together with the bytes needed to update it under
	/// compare-and-swap.
	///
	/// # Arguments
	///
	/// * `quote_id` - Identifier returned when the quote was issued
	///
	/// # Returns
	///
	/// Returns `NotFound` when no quote has that id.
	pub async fn quote(&self, quote_id: &str) -> Result<Snapshot<Quote>, StateError> {
		self.storage
			.retrieve_snapshot(StorageKey::Quotes.as_str(), quote_id)
			.await
			.map_err(|e| match e {
				StorageError::NotFound => StateError::NotFound(format!("quote {}", quote_id)),
				other => other.into(),
			})
	}

	/// Moves an active quote to `expired`.
	///
	/// Returns `false` when the quote changed underneath (typically because
	/// it was just consumed), in which case nothing is written.
	pub async fn expire_quote(&self, snapshot: &Snapshot<Quote>) -> Result<bool, StateError> {
		let current = &snapshot.value;
		if !current.status.can_transition_to(QuoteStatus::Expired) {
			return Err(StateError::InvalidQuoteTransition {
				from: current.status,
				to: QuoteStatus::Expired,
			});
		}

		let mut expired = current.clone();
		expired.status = QuoteStatus::Expired;

		let result = self
			.storage
			.transaction()
			.expect_unchanged(StorageKey::Quotes.as_str(), &current.id, snapshot)
			.put(StorageKey::Quotes.as_str(), &current.id, &expired, None)?
			.commit()
			.await;

		match result {
			Ok(()) => Ok(true),
			Err(StorageError::Conflict(_)) => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Records a verified payment, marks the quote `used` and queues the job,
	/// all in one atomic write.
	///
	/// Fails with `Conflict` when the quote is no longer exactly as read in
	/// `snapshot`; in that case none of the three records is written.
	pub async fn consume_quote(
		&self,
		snapshot: &Snapshot<Quote>,
		payment: &Payment,
		job: &Job,
	) -> Result<(), StateError> {
		let current = &snapshot.value;
		if !current.status.can_transition_to(QuoteStatus::Used) {
			return Err(StateError::InvalidQuoteTransition {
				from: current.status,
				to: QuoteStatus::Used,
			});
		}

		let mut used = current.clone();
		used.status = QuoteStatus::Used;

		self.storage
			.transaction()
			.expect_unchanged(StorageKey::Quotes.as_str(), &current.id, snapshot)
			.expect_absent(StorageKey::Payments.as_str(), &payment.id)
			.expect_absent(StorageKey::Jobs.as_str(), &job.id)
			.put(StorageKey::Payments.as_str(), &payment.id, payment, None)?
			.put(StorageKey::Quotes.as_str(), &current.id, &used, None)?
			.put(StorageKey::Jobs.as_str(), &job.id, job, None)?
			.commit()
			.await?;
		Ok(())
	}

	/// Every stored quote, whatever its status.
	pub async fn quotes(&self) -> Result<Vec<Snapshot<Quote>>, StateError> {
		Ok(self
			.storage
			.retrieve_all_snapshots(StorageKey::Quotes.as_str())
			.await?
			.into_iter()
			.map(|(_, snapshot)| snapshot)
			.collect())
	}

	/// Loads a recorded payment.
	///
	/// # Arguments
	///
	/// * `payment_id` - Identifier from the settlement receipt
	///
	/// # Returns
	///
	/// Returns `NotFound` when no payment has that id.
	pub async fn payment(&self, payment_id: &str) -> Result<Payment, StateError> {
		self.storage
			.retrieve(StorageKey::Payments.as_str(), payment_id)
			.await
			.map_err(|e| match e {
				StorageError::NotFound => StateError::NotFound(format!("payment {}", payment_id)),
				other => other.into(),
			})
	}

	/// Every recorded payment.
	pub async fn payments(&self) -> Result<Vec<Payment>, StateError> {
		Ok(self
			.storage
			.retrieve_all::<Payment>(StorageKey::Payments.as_str())
			.await?
			.into_iter()
			.map(|(_, payment)| payment)
			.collect())
	}

	/// Quote ids that have a recorded payment.
	pub async fn paid_quote_ids(&self) -> Result<HashSet<String>, StateError> {
		Ok(self
			.payments()
			.await?
			.into_iter()
			.map(|payment| payment.quote_id)
			.collect())
	}

	/// Completes storage commits a crash left half-applied; returns how many.
	pub async fn recover_storage(&self) -> Result<usize, StateError> {
		Ok(self.storage.recover().await?)
	}

	/// Loads a job.
	///
	/// # Arguments
	///
	/// * `job_id` - Identifier from the settlement receipt
	///
	/// # Returns
	///
	/// Returns `NotFound` when no job has that id.
	pub async fn job(&self, job_id: &str) -> Result<Job, StateError> {
		self.job_snapshot(job_id).await.map(Snapshot::into_inner)
	}

	async fn job_snapshot(&self, job_id: &str) -> Result<Snapshot<Job>, StateError> {
		self.storage
			.retrieve_snapshot(StorageKey::Jobs.as_str(), job_id)
			.await
			.map_err(|e| match e {
				StorageError::NotFound => StateError::NotFound(format!("job {}", job_id)),
				other => other.into(),
			})
	}

	/// Every stored job, in no particular order.
	pub async fn jobs(&self) -> Result<Vec<Job>, StateError> {
		Ok(self
			.storage
			.retrieve_all::<Job>(StorageKey::Jobs.as_str())
			.await?
			.into_iter()
			.map(|(_, job)| job)
			.collect())
	}

	/// Moves a job to `next`, applying `updater` to the record first.
	///
	/// The transition is validated against the job's stored status and
	/// written with compare-and-swap, so exactly one caller wins a race for
	/// the same transition. Entering a terminal status stamps `completed_at`.
	pub async fn transition_job<F>(
		&self,
		job_id: &str,
		next: JobStatus,
		updater: F,
	) -> Result<Job, StateError>
	where
		F: FnOnce(&mut Job),
	{
		let snapshot = self.job_snapshot(job_id).await?;
		let from = snapshot.value.status;
		if !from.can_transition_to(next) {
			return Err(StateError::InvalidJobTransition { from, to: next });
		}

		let mut job = snapshot.value.clone();
		updater(&mut job);
		job.status = next;
		if next.is_terminal() {
			job.completed_at = Some(current_timestamp());
		}

		self.storage
			.transaction()
			.expect_unchanged(StorageKey::Jobs.as_str(), job_id, &snapshot)
			.put(StorageKey::Jobs.as_str(), job_id, &job, None)?
			.commit()
			.await?;
		Ok(job)
	}

	/// Live idempotency entry for `key`, if any.
	pub async fn idempotency_entry(
		&self,
		key: &str,
	) -> Result<Option<Snapshot<IdempotencyEntry>>, StateError> {
		match self
			.storage
			.retrieve_snapshot::<IdempotencyEntry>(StorageKey::Idempotency.as_str(), key)
			.await
		{
			Ok(snapshot) => Ok(Some(snapshot)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// Claims `key` for an in-flight request.
	///
	/// A logically expired entry the backend has not dropped yet is replaced
	/// under compare-and-swap.
	pub async fn reserve_idempotency(
		&self,
		key: &str,
		ttl: Duration,
		now: DateTime<Utc>,
	) -> Result<Reservation, StateError> {
		let entry = IdempotencyEntry::pending(key, now, ttl);
		let existing = self.idempotency_entry(key).await?;

		let tx = match &existing {
			Some(snapshot) if !snapshot.value.is_expired_at(now) => {
				let live = &snapshot.value;
				return Ok(match (live.state, &live.response) {
					(IdempotencyState::Completed, Some(body)) => Reservation::Completed(body.clone()),
					_ => Reservation::InFlight,
				});
			},
			Some(stale) => self
				.storage
				.transaction()
				.expect_unchanged(StorageKey::Idempotency.as_str(), key, stale),
			None => self
				.storage
				.transaction()
				.expect_absent(StorageKey::Idempotency.as_str(), key),
		};

		match tx
			.put(StorageKey::Idempotency.as_str(), key, &entry, Some(ttl))?
			.commit()
			.await
		{
			Ok(()) => Ok(Reservation::Acquired(entry)),
			Err(StorageError::Conflict(_)) => Ok(Reservation::InFlight),
			Err(e) => Err(e.into()),
		}
	}

	/// Replaces the reservation `held` with a completed entry holding
	/// `response`.
	///
	/// Fails with `Conflict` when the reservation is no longer the one in
	/// storage (it expired and another request took the key).
	pub async fn complete_idempotency(
		&self,
		held: &IdempotencyEntry,
		response: String,
		ttl: Duration,
		now: DateTime<Utc>,
	) -> Result<(), StateError> {
		let entry = IdempotencyEntry::completed(&held.key, response, now, ttl);
		self.storage
			.transaction()
			.expect_value(StorageKey::Idempotency.as_str(), &held.key, held)?
			.put(StorageKey::Idempotency.as_str(), &held.key, &entry, Some(ttl))?
			.commit()
			.await?;
		Ok(())
	}

	/// Drops the reservation `held`.
	///
	/// Returns `false` without writing when the key has since been taken by
	/// another request.
	pub async fn release_idempotency(&self, held: &IdempotencyEntry) -> Result<bool, StateError> {
		let tx = self
			.storage
			.transaction()
			.expect_value(StorageKey::Idempotency.as_str(), &held.key, held)?
			.delete(StorageKey::Idempotency.as_str(), &held.key);
		delete_outcome(tx.commit().await)
	}

	/// Deletes the entry under `key` only if it is still exactly as captured
	/// in `snapshot`.
	pub async fn remove_idempotency_if_unchanged(
		&self,
		key: &str,
		snapshot: &Snapshot<IdempotencyEntry>,
	) -> Result<bool, StateError> {
		let tx = self
			.storage
			.transaction()
			.expect_unchanged(StorageKey::Idempotency.as_str(), key, snapshot)
			.delete(StorageKey::Idempotency.as_str(), key);
		delete_outcome(tx.commit().await)
	}

	/// Deletes idempotency entries whose expiry has passed; returns how many.
	///
	/// An entry rewritten between the scan and the delete (a fresh
	/// reservation replacing a stale one) is left alone.
	pub async fn purge_idempotency(&self, now: DateTime<Utc>) -> Result<usize, StateError> {
		let mut purged = 0;
		for (key, snapshot) in self
			.storage
			.retrieve_all_snapshots::<IdempotencyEntry>(StorageKey::Idempotency.as_str())
			.await?
		{
			if snapshot.value.is_expired_at(now)
				&& self.remove_idempotency_if_unchanged(&key, &snapshot).await?
			{
				purged += 1;
			}
		}
		Ok(purged)
	}
}

fn delete_outcome(result: Result<(), StorageError>) -> Result<bool, StateError> {
	match result {
		Ok(()) => Ok(true),
		Err(StorageError::Conflict(_)) => Ok(false),
		Err(e) => Err(e.into()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration as ChronoDuration;
	use paycall_storage::implementations::memory::MemoryStorage;
	use paycall_types::{PaymentClaim, PaymentStatus};
	use serde_json::json;

	fn store() -> StateStore {
		StateStore::new(Arc::new(StorageService::new(Box::new(MemoryStorage::new()))))
	}

	fn quote(id: &str) -> Quote {
		let now = current_timestamp();
		Quote {
			id: id.to_string(),
			endpoint: "compute".to_string(),
			units: Default::default(),
			price_sats: 1,
			expires_at: now + ChronoDuration::seconds(30),
			nonce: format!("nonce-{id}"),
			receiver: "receiver".to_string(),
			locator: "locator".to_string(),
			status: QuoteStatus::Active,
			created_at: now,
		}
	}

	fn payment(id: &str, quote_id: &str) -> Payment {
		Payment {
			id: id.to_string(),
			quote_id: quote_id.to_string(),
			sender: "alice".to_string(),
			amount_sats: 1,
			settlement_ref: format!("stl_{id}"),
			claim: PaymentClaim::default(),
			status: PaymentStatus::Verified,
			created_at: current_timestamp(),
		}
	}

	fn job(id: &str, payment_id: &str) -> Job {
		Job {
			id: id.to_string(),
			payment_id: payment_id.to_string(),
			endpoint: "compute".to_string(),
			args: json!({}),
			status: JobStatus::Queued,
			result: None,
			error: None,
			created_at: current_timestamp(),
			completed_at: None,
		}
	}

	#[tokio::test]
	async fn test_consume_quote_writes_all_three_records() {
		let state = store();
		state.insert_quote(&quote("q1")).await.unwrap();

		let snapshot = state.quote("q1").await.unwrap();
		state
			.consume_quote(&snapshot, &payment("p1", "q1"), &job("j1", "p1"))
			.await
			.unwrap();

		assert_eq!(state.quote("q1").await.unwrap().value.status, QuoteStatus::Used);
		assert_eq!(state.payment("p1").await.unwrap().quote_id, "q1");
		assert_eq!(state.job("j1").await.unwrap().status, JobStatus::Queued);
	}

	#[tokio::test]
	async fn test_second_consumer_of_same_snapshot_conflicts() {
		let state = store();
		state.insert_quote(&quote("q1")).await.unwrap();

		let first = state.quote("q1").await.unwrap();
		let second = state.quote("q1").await.unwrap();

		state
			.consume_quote(&first, &payment("p1", "q1"), &job("j1", "p1"))
			.await
			.unwrap();
		let err = state
			.consume_quote(&second, &payment("p2", "q1"), &job("j2", "p2"))
			.await
			.unwrap_err();

		assert!(matches!(err, StateError::Conflict(_)));
		assert!(matches!(state.payment("p2").await, Err(StateError::NotFound(_))));
		assert!(matches!(state.job("j2").await, Err(StateError::NotFound(_))));
	}

	#[tokio::test]
	async fn test_expire_loses_to_consume() {
		let state = store();
		state.insert_quote(&quote("q1")).await.unwrap();

		let stale = state.quote("q1").await.unwrap();
		state
			.consume_quote(&stale, &payment("p1", "q1"), &job("j1", "p1"))
			.await
			.unwrap();

		assert!(!state.expire_quote(&stale).await.unwrap());
		assert_eq!(state.quote("q1").await.unwrap().value.status, QuoteStatus::Used);
	}

	#[tokio::test]
	async fn test_duplicate_quote_id_rejected() {
		let state = store();
		state.insert_quote(&quote("q1")).await.unwrap();
		assert!(matches!(
			state.insert_quote(&quote("q1")).await,
			Err(StateError::Conflict(_))
		));
	}

	#[tokio::test]
	async fn test_job_transitions_are_validated() {
		let state = store();
		state.insert_quote(&quote("q1")).await.unwrap();
		let snapshot = state.quote("q1").await.unwrap();
		state
			.consume_quote(&snapshot, &payment("p1", "q1"), &job("j1", "p1"))
			.await
			.unwrap();

		let err = state
			.transition_job("j1", JobStatus::Completed, |_| {})
			.await
			.unwrap_err();
		assert!(matches!(err, StateError::InvalidJobTransition { .. }));

		state
			.transition_job("j1", JobStatus::Processing, |_| {})
			.await
			.unwrap();
		let done = state
			.transition_job("j1", JobStatus::Completed, |j| j.result = Some(json!(1)))
			.await
			.unwrap();
		assert_eq!(done.result, Some(json!(1)));
		assert!(done.completed_at.is_some());

		assert!(state
			.transition_job("j1", JobStatus::Failed, |_| {})
			.await
			.is_err());
	}

	fn acquired(reservation: Reservation) -> IdempotencyEntry {
		match reservation {
			Reservation::Acquired(entry) => entry,
			other => panic!("expected Acquired, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_idempotency_reservation_lifecycle() {
		let state = store();
		let ttl = Duration::from_secs(120);
		let now = current_timestamp();

		let held = acquired(state.reserve_idempotency("k", ttl, now).await.unwrap());
		assert_eq!(held.state, IdempotencyState::Pending);
		assert_eq!(
			state.reserve_idempotency("k", ttl, now).await.unwrap(),
			Reservation::InFlight
		);

		state
			.complete_idempotency(&held, "{\"status\":\"ok\"}".into(), ttl, now)
			.await
			.unwrap();
		assert_eq!(
			state.reserve_idempotency("k", ttl, now).await.unwrap(),
			Reservation::Completed("{\"status\":\"ok\"}".into())
		);

		// The completed entry is no longer the reservation that was held.
		assert!(!state.release_idempotency(&held).await.unwrap());
		assert!(state.idempotency_entry("k").await.unwrap().is_some());
	}

	#[tokio::test]
	async fn test_release_frees_the_key() {
		let state = store();
		let ttl = Duration::from_secs(120);
		let now = current_timestamp();

		let held = acquired(state.reserve_idempotency("k", ttl, now).await.unwrap());
		assert!(state.release_idempotency(&held).await.unwrap());
		acquired(state.reserve_idempotency("k", ttl, now).await.unwrap());
	}

	#[tokio::test]
	async fn test_logically_expired_entry_is_replaced() {
		let state = store();
		let ttl = Duration::from_secs(120);
		let then = current_timestamp();

		let held = acquired(state.reserve_idempotency("k", ttl, then).await.unwrap());
		state
			.complete_idempotency(&held, "old".into(), ttl, then)
			.await
			.unwrap();

		let later = then + ChronoDuration::seconds(121);
		acquired(state.reserve_idempotency("k", ttl, later).await.unwrap());
		assert_eq!(state.purge_idempotency(later).await.unwrap(), 0);
		assert_eq!(
			state
				.purge_idempotency(later + ChronoDuration::seconds(121))
				.await
				.unwrap(),
			1
		);
	}

	#[tokio::test]
	async fn test_stale_purge_spares_fresh_reservation() {
		let state = store();
		let ttl = Duration::from_secs(120);
		let then = current_timestamp() - ChronoDuration::seconds(600);
		let now = current_timestamp();

		acquired(state.reserve_idempotency("k", ttl, then).await.unwrap());
		let stale = state.idempotency_entry("k").await.unwrap().unwrap();
		assert!(stale.value.is_expired_at(now));

		// A new request takes the key between the sweep's read and its delete.
		acquired(state.reserve_idempotency("k", ttl, now).await.unwrap());

		assert!(!state
			.remove_idempotency_if_unchanged("k", &stale)
			.await
			.unwrap());
		assert_eq!(
			state.reserve_idempotency("k", ttl, now).await.unwrap(),
			Reservation::InFlight
		);
		assert_eq!(state.purge_idempotency(now).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_overdue_holder_cannot_release_or_complete_new_reservation() {
		let state = store();
		let ttl = Duration::from_secs(120);
		let then = current_timestamp() - ChronoDuration::seconds(600);
		let now = current_timestamp();

		let overdue = acquired(state.reserve_idempotency("k", ttl, then).await.unwrap());
		let fresh = acquired(state.reserve_idempotency("k", ttl, now).await.unwrap());

		assert!(!state.release_idempotency(&overdue).await.unwrap());
		assert!(matches!(
			state
				.complete_idempotency(&overdue, "late".into(), ttl, now)
				.await,
			Err(StateError::Conflict(_))
		));
		assert_eq!(
			state.reserve_idempotency("k", ttl, now).await.unwrap(),
			Reservation::InFlight
		);

		state
			.complete_idempotency(&fresh, "fresh".into(), ttl, now)
			.await
			.unwrap();
		assert_eq!(
			state.reserve_idempotency("k", ttl, now).await.unwrap(),
			Reservation::Completed("fresh".into())
		);
	}
}
