//! `GET /v1/jobs/{id}`.

use paycall_core::{PaycallEngine, StateError};
use paycall_types::{APIError, Job};

pub async fn get_job(job_id: &str, engine: &PaycallEngine) -> Result<Job, APIError> {
	engine.job(job_id).await.map_err(|e| match e {
		StateError::NotFound(_) => APIError::NotFound {
			error_type: "job_not_found".to_string(),
			message: format!("job {} not found", job_id),
		},
		other => APIError::InternalServerError {
			error_type: "storage_error".to_string(),
			message: other.to_string(),
			details: None,
		},
	})
}
