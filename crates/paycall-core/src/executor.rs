//! Job execution.

use crate::state::{StateError, StateStore};
use paycall_jobs::HandlerRegistry;
use paycall_types::{truncate_id, Job, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Runs queued jobs through their endpoint's handler.
pub struct JobExecutor {
	state: Arc<StateStore>,
	handlers: Arc<HandlerRegistry>,
	timeout: Duration,
}

impl JobExecutor {
	/// Creates a new executor.
	///
	/// # Arguments
	///
	/// * `state` - Store holding the job records
	/// * `handlers` - Endpoint handlers, looked up by the job's endpoint
	/// * `timeout` - Upper bound on a single handler run
	pub fn new(state: Arc<StateStore>, handlers: Arc<HandlerRegistry>, timeout: Duration) -> Self {
		Self {
			state,
			handlers,
			timeout,
		}
	}

	/// Executes a queued job and returns its terminal record.
	///
	/// Claiming the job (queued -> processing) is a compare-and-swap, so a
	/// job runs at most once even if `execute` is called twice. A missing
	/// handler, a handler error and a timeout all end the job `failed`; none
	/// of them is an `Err` here. `Err` means the job record itself could not
	/// be read or written.
	#[instrument(skip_all, fields(job_id = %truncate_id(job_id)))]
	pub async fn execute(&self, job_id: &str) -> Result<Job, StateError> {
		let job = self
			.state
			.transition_job(job_id, JobStatus::Processing, |_| {})
			.await?;

		let outcome = match self.handlers.get(&job.endpoint) {
			None => Err(format!(
				"no handler registered for endpoint '{}'",
				job.endpoint
			)),
			Some(handler) => match tokio::time::timeout(self.timeout, handler.execute(&job.args)).await
			{
				Ok(Ok(result)) => Ok(result),
				Ok(Err(e)) => Err(e.to_string()),
				Err(_) => Err(format!("job timed out after {}s", self.timeout.as_secs())),
			},
		};

		match outcome {
			Ok(result) => {
				tracing::info!(endpoint = %job.endpoint, "Job completed");
				self.state
					.transition_job(job_id, JobStatus::Completed, |j| j.result = Some(result))
					.await
			},
			Err(error) => {
				tracing::warn!(endpoint = %job.endpoint, error = %error, "Job failed");
				self.state
					.transition_job(job_id, JobStatus::Failed, |j| j.error = Some(error))
					.await
			},
		}
	}
}
