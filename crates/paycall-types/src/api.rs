//! API types for the paycall HTTP API.
//!
//! Request and response bodies for `/v1/quote`, `/v1/paycall`, `/v1/jobs` and
//! `/health`, plus the structured error type every handler returns.

use crate::{PaymentClaim, UnitCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Where and how a caller should address payment for a quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementInfo {
	/// Settlement network locator.
	pub locator: String,
	/// Identity that must receive the payment.
	pub receiver: String,
	/// Best-effort hint about the current settlement round, if available.
	pub round_hint: Option<String>,
}

/// Response body of `GET /v1/quote`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteResponse {
	pub endpoint: String,
	pub units: UnitCounts,
	pub price_sats: u64,
	/// ISO-8601 expiry.
	pub expires_at: DateTime<Utc>,
	pub quote_id: String,
	pub settlement: SettlementInfo,
}

/// The call a payment is meant to pay for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
	pub endpoint: String,
	#[serde(default)]
	pub args: Value,
}

/// Request body of `POST /v1/paycall`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaycallRequest {
	pub quote_id: String,
	#[serde(default)]
	pub payment_claim: PaymentClaim,
	pub request: CallRequest,
}

/// Proof of what was paid and which records were created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
	pub settlement_ref: String,
	pub paid_amount: u64,
	pub job_id: String,
	pub payment_id: String,
}

/// Successful response body of `POST /v1/paycall`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaycallResponse {
	/// Always "ok".
	pub status: String,
	pub result: Value,
	pub receipt: Receipt,
}

/// Verifier portion of the health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierHealth {
	pub name: String,
	pub healthy: bool,
	pub round_hint: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

/// Response body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
	/// "ok" or "degraded".
	pub status: String,
	pub verifier: VerifierHealth,
}

/// API error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// Error type/code
	pub error: String,
	/// Human-readable description
	pub message: String,
	/// Additional error context
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub details: Option<Value>,
}

/// Structured API error type with appropriate HTTP status mapping.
#[derive(Debug)]
pub enum APIError {
	/// Malformed input or endpoint mismatch (400)
	BadRequest {
		error_type: String,
		message: String,
		details: Option<Value>,
	},
	/// Payment claim rejected (402)
	PaymentRequired {
		error_type: String,
		message: String,
		details: Option<Value>,
	},
	/// Unknown resource (404)
	NotFound { error_type: String, message: String },
	/// Missing, expired or consumed quote, or a request already in flight (409)
	Conflict { error_type: String, message: String },
	/// Job or storage failure (500)
	InternalServerError {
		error_type: String,
		message: String,
		details: Option<Value>,
	},
	/// Upstream collaborator unavailable (503)
	ServiceUnavailable { error_type: String, message: String },
}

impl APIError {
	/// Get the HTTP status code for this error.
	pub fn status_code(&self) -> u16 {
		match self {
			APIError::BadRequest { .. } => 400,
			APIError::PaymentRequired { .. } => 402,
			APIError::NotFound { .. } => 404,
			APIError::Conflict { .. } => 409,
			APIError::InternalServerError { .. } => 500,
			APIError::ServiceUnavailable { .. } => 503,
		}
	}

	/// Convert to ErrorResponse for JSON serialization.
	pub fn to_error_response(&self) -> ErrorResponse {
		let (error, message, details) = match self {
			APIError::BadRequest {
				error_type,
				message,
				details,
			}
			| APIError::PaymentRequired {
				error_type,
				message,
				details,
			}
			| APIError::InternalServerError {
				error_type,
				message,
				details,
			} => (error_type, message, details.clone()),
			APIError::NotFound {
				error_type,
				message,
			}
			| APIError::Conflict {
				error_type,
				message,
			}
			| APIError::ServiceUnavailable {
				error_type,
				message,
			} => (error_type, message, None),
		};
		ErrorResponse {
			error: error.clone(),
			message: message.clone(),
			details,
		}
	}
}

impl fmt::Display for APIError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let response = self.to_error_response();
		write!(f, "{} ({}): {}", response.error, self.status_code(), response.message)
	}
}

impl std::error::Error for APIError {}

impl axum::response::IntoResponse for APIError {
	fn into_response(self) -> axum::response::Response {
		use axum::{http::StatusCode, response::Json};

		let status = StatusCode::from_u16(self.status_code())
			.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		(status, Json(self.to_error_response())).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_paycall_request_tolerates_missing_claim_fields() {
		let request: PaycallRequest = serde_json::from_value(json!({
			"quote_id": "q1",
			"payment_claim": { "sender": "alice" },
			"request": { "endpoint": "compute" }
		}))
		.unwrap();

		assert_eq!(request.payment_claim.spend_blob, "");
		assert_eq!(request.payment_claim.sender, "alice");
		assert_eq!(request.request.args, Value::Null);
	}

	#[test]
	fn test_error_response_omits_empty_details() {
		let err = APIError::Conflict {
			error_type: "expired_or_missing_quote".into(),
			message: "Quote not found".into(),
		};
		assert_eq!(err.status_code(), 409);

		let body = serde_json::to_value(err.to_error_response()).unwrap();
		assert_eq!(
			body,
			json!({ "error": "expired_or_missing_quote", "message": "Quote not found" })
		);
	}

	#[test]
	fn test_payment_required_carries_details() {
		let err = APIError::PaymentRequired {
			error_type: "payment_invalid".into(),
			message: "Payment claim rejected".into(),
			details: Some(json!({ "reason": "missing_payment_data" })),
		};
		assert_eq!(err.status_code(), 402);
		assert_eq!(
			err.to_error_response().details,
			Some(json!({ "reason": "missing_payment_data" }))
		);
	}
}
