//! `GET /health`.

use axum::http::StatusCode;
use paycall_core::PaycallEngine;
use paycall_types::HealthResponse;

/// Health report and the status code to send it with.
pub async fn health(engine: &PaycallEngine) -> (StatusCode, HealthResponse) {
	let report = engine.health().await;
	let status = if report.verifier.healthy {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	};
	(status, report)
}
