//! Job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	Queued,
	Processing,
	Completed,
	Failed,
}

impl JobStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, JobStatus::Completed | JobStatus::Failed)
	}

	/// Queued -> Processing -> {Completed, Failed}. A queued job may also be
	/// failed directly when it never started (e.g. recovery after a crash).
	pub fn can_transition_to(self, next: JobStatus) -> bool {
		matches!(
			(self, next),
			(JobStatus::Queued, JobStatus::Processing)
				| (JobStatus::Queued, JobStatus::Failed)
				| (JobStatus::Processing, JobStatus::Completed)
				| (JobStatus::Processing, JobStatus::Failed)
		)
	}
}

/// One execution of the work paid for by a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
	pub id: String,
	/// Payment that paid for this job.
	pub payment_id: String,
	pub endpoint: String,
	/// Handler arguments as supplied by the caller.
	pub args: Value,
	pub status: JobStatus,
	/// Present only when completed.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	/// Present only when failed.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	pub created_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_terminal_statuses_never_move() {
		for next in [
			JobStatus::Queued,
			JobStatus::Processing,
			JobStatus::Completed,
			JobStatus::Failed,
		] {
			assert!(!JobStatus::Completed.can_transition_to(next));
			assert!(!JobStatus::Failed.can_transition_to(next));
		}
		assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
		assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
	}
}
