//! `POST /v1/paycall`.

use paycall_core::{PaycallEngine, Settlement, SettlementError};
use paycall_types::{APIError, PaycallRequest};
use serde_json::json;
use tracing::{info, warn};

/// Settles a paid call.
///
/// A live cached response for the idempotency key is returned before the
/// body is even parsed, so a retry is answered the same way whatever it
/// carries.
pub async fn settle(
	body: &[u8],
	idempotency_key: Option<&str>,
	engine: &PaycallEngine,
) -> Result<Settlement, APIError> {
	if let Some(key) = idempotency_key {
		if let Some(body) = engine
			.settlement()
			.cached_response(key)
			.await
			.map_err(to_api_error)?
		{
			info!("Replaying cached paycall response");
			return Ok(Settlement {
				body,
				replayed: true,
			});
		}
	}

	let request: PaycallRequest = serde_json::from_slice(body).map_err(|e| APIError::BadRequest {
		error_type: "invalid_request".to_string(),
		message: format!("invalid request body: {}", e),
		details: None,
	})?;

	engine
		.settlement()
		.settle(request, idempotency_key)
		.await
		.map_err(|e| {
			warn!(error = %e, "Paycall failed");
			to_api_error(e)
		})
}

/// Maps settlement failures onto the public error codes.
///
/// Missing, expired and already-used quotes all surface as
/// `expired_or_missing_quote`.
pub fn to_api_error(err: SettlementError) -> APIError {
	let message = err.to_string();
	match err {
		SettlementError::InvalidRequest(_) => APIError::BadRequest {
			error_type: "invalid_request".to_string(),
			message,
			details: None,
		},
		SettlementError::QuoteNotFound(_)
		| SettlementError::QuoteExpired(_)
		| SettlementError::QuoteNotActive(_) => APIError::Conflict {
			error_type: "expired_or_missing_quote".to_string(),
			message,
		},
		SettlementError::EndpointMismatch { .. } => APIError::BadRequest {
			error_type: "endpoint_mismatch".to_string(),
			message,
			details: None,
		},
		SettlementError::PaymentInvalid { reason, .. } => APIError::PaymentRequired {
			error_type: "payment_invalid".to_string(),
			message,
			details: Some(json!({ "reason": reason.as_str() })),
		},
		SettlementError::VerifierUnavailable(_) => APIError::ServiceUnavailable {
			error_type: "verifier_unavailable".to_string(),
			message,
		},
		SettlementError::JobExecutionFailed {
			job_id, payment_id, ..
		} => APIError::InternalServerError {
			error_type: "job_execution_failed".to_string(),
			message,
			details: Some(json!({ "job_id": job_id, "payment_id": payment_id })),
		},
		SettlementError::RequestInProgress => APIError::Conflict {
			error_type: "request_in_progress".to_string(),
			message,
		},
		SettlementError::Storage(_) => APIError::InternalServerError {
			error_type: "storage_error".to_string(),
			message,
			details: None,
		},
		SettlementError::Internal(_) => APIError::InternalServerError {
			error_type: "internal_error".to_string(),
			message,
			details: None,
		},
	}
}
