//! `GET /v1/quote`.
//!
//! The `endpoint` query parameter names the call being priced; every other
//! parameter is a unit count (`tokens=1000`, `images=3`, ...).

use paycall_core::{PaycallEngine, QuoteError};
use paycall_types::{APIError, QuoteResponse, UnitCounts};
use std::collections::HashMap;
use tracing::warn;

pub async fn issue_quote(
	params: HashMap<String, String>,
	engine: &PaycallEngine,
) -> Result<QuoteResponse, APIError> {
	let mut params = params;
	let endpoint = params.remove("endpoint").unwrap_or_default();

	let mut units = UnitCounts::new();
	for (kind, raw) in params {
		let value: f64 = raw.trim().parse().map_err(|_| APIError::BadRequest {
			error_type: "invalid_request".to_string(),
			message: format!("unit count '{}' must be a number, got '{}'", kind, raw),
			details: None,
		})?;
		units.insert(kind, value);
	}
	let units = (!units.is_empty()).then_some(units);

	engine
		.quotes()
		.issue_quote(&endpoint, units)
		.await
		.map_err(|e| {
			warn!(error = %e, "Quote request failed");
			match e {
				QuoteError::InvalidRequest(message) => APIError::BadRequest {
					error_type: "invalid_request".to_string(),
					message,
					details: None,
				},
				QuoteError::State(e) => APIError::InternalServerError {
					error_type: "storage_error".to_string(),
					message: e.to_string(),
					details: None,
				},
			}
		})
}
