//! HTTP server for the paycall API.

use axum::{
	body::Bytes,
	extract::{DefaultBodyLimit, Path, Query, State},
	http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
	response::{IntoResponse, Json, Response},
	routing::{get, post},
	Router,
};
use paycall_config::ApiConfig;
use paycall_core::PaycallEngine;
use paycall_types::{APIError, HealthResponse, Job, QuoteResponse};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Request header carrying the caller's idempotency key.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Response header set on replayed paycall responses.
pub const IDEMPOTENT_REPLAY: &str = "idempotent-replayed";

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	pub engine: Arc<PaycallEngine>,
}

/// Builds the API router.
pub fn router(engine: Arc<PaycallEngine>, api_config: &ApiConfig) -> Router {
	Router::new()
		.route("/health", get(handle_health))
		.nest(
			"/v1",
			Router::new()
				.route("/quote", get(handle_quote))
				.route("/paycall", post(handle_paycall))
				.route("/jobs/{id}", get(handle_get_job)),
		)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(cors_layer(api_config))
				.layer(DefaultBodyLimit::max(api_config.max_request_size)),
		)
		.with_state(AppState { engine })
}

fn cors_layer(api_config: &ApiConfig) -> CorsLayer {
	let origins = match &api_config.cors {
		Some(cors) if !cors.allowed_origins.iter().any(|o| o == "*") => &cors.allowed_origins,
		_ => return CorsLayer::permissive(),
	};

	let origins: Vec<HeaderValue> = origins
		.iter()
		.filter_map(|origin| match HeaderValue::from_str(origin) {
			Ok(value) => Some(value),
			Err(_) => {
				tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
				None
			},
		})
		.collect();

	CorsLayer::new()
		.allow_origin(origins)
		.allow_methods(Any)
		.allow_headers(Any)
}

/// Serves the API until `shutdown` resolves.
pub async fn start_server(
	api_config: ApiConfig,
	engine: Arc<PaycallEngine>,
	shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
	let app = router(engine, &api_config);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Paycall API server starting on {}", bind_address);

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown)
		.await?;

	Ok(())
}

/// Handles GET /v1/quote requests.
async fn handle_quote(
	State(state): State<AppState>,
	Query(params): Query<HashMap<String, String>>,
) -> Result<Json<QuoteResponse>, APIError> {
	crate::apis::quote::issue_quote(params, &state.engine)
		.await
		.map(Json)
}

/// Handles POST /v1/paycall requests.
///
/// The body is taken raw so malformed JSON gets the API's error shape, and
/// the success body is sent exactly as serialized so replays match byte for
/// byte.
async fn handle_paycall(
	State(state): State<AppState>,
	headers: HeaderMap,
	body: Bytes,
) -> Result<Response, APIError> {
	let key = match headers.get(IDEMPOTENCY_KEY) {
		None => None,
		Some(value) => Some(value.to_str().map_err(|_| APIError::BadRequest {
			error_type: "invalid_request".to_string(),
			message: "Idempotency-Key must be visible ASCII".to_string(),
			details: None,
		})?),
	};

	let settlement = crate::apis::paycall::settle(&body, key, &state.engine).await?;

	let mut response = (
		StatusCode::OK,
		[(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
		settlement.body,
	)
		.into_response();
	if settlement.replayed {
		response.headers_mut().insert(
			HeaderName::from_static(IDEMPOTENT_REPLAY),
			HeaderValue::from_static("true"),
		);
	}
	Ok(response)
}

/// Handles GET /v1/jobs/{id} requests.
async fn handle_get_job(
	Path(id): Path<String>,
	State(state): State<AppState>,
) -> Result<Json<Job>, APIError> {
	crate::apis::job::get_job(&id, &state.engine).await.map(Json)
}

/// Handles GET /health requests.
async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
	let (status, report) = crate::apis::health::health(&state.engine).await;
	(status, Json(report))
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::{to_bytes, Body};
	use axum::http::Request;
	use paycall_config::ConfigBuilder;
	use paycall_core::{PaycallBuilder, PaycallFactories};
	use serde_json::{json, Value};
	use tower::ServiceExt;

	const CLAIM: &str = r#"{"spend_blob":"c3BlbmQtYmxvYi0wMDAx","proof":"cHJvb2Y=","sender":"alice"}"#;

	fn app() -> Router {
		let engine = PaycallBuilder::new(ConfigBuilder::new().build())
			.build(PaycallFactories::builtin())
			.unwrap();
		router(Arc::new(engine), &ApiConfig::default())
	}

	async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
		let response = app.clone().oneshot(request).await.unwrap();
		let status = response.status();
		let headers = response.headers().clone();
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		(status, headers, body.to_vec())
	}

	async fn quote(app: &Router, query: &str) -> Value {
		let (status, _, body) = send(
			app,
			Request::get(format!("/v1/quote?{query}"))
				.body(Body::empty())
				.unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		serde_json::from_slice(&body).unwrap()
	}

	fn paycall(quote_id: &str, endpoint: &str, args: Value, key: Option<&str>) -> Request<Body> {
		let body = format!(
			r#"{{"quote_id":"{quote_id}","payment_claim":{CLAIM},"request":{{"endpoint":"{endpoint}","args":{args}}}}}"#
		);
		let mut builder = Request::post("/v1/paycall").header(header::CONTENT_TYPE, "application/json");
		if let Some(key) = key {
			builder = builder.header("Idempotency-Key", key);
		}
		builder.body(Body::from(body)).unwrap()
	}

	fn error_code(body: &[u8]) -> String {
		let value: Value = serde_json::from_slice(body).unwrap();
		value["error"].as_str().unwrap().to_string()
	}

	#[tokio::test]
	async fn test_quote_prices_units() {
		let app = app();
		let body = quote(&app, "endpoint=summarize&tokens=1000").await;
		assert_eq!(body["price_sats"], json!(50));
		assert_eq!(body["endpoint"], json!("summarize"));
		assert_eq!(body["settlement"]["receiver"], json!("npub1testreceiver"));
		assert!(body["quote_id"].is_string());
		assert!(body["expires_at"].is_string());
	}

	#[tokio::test]
	async fn test_quote_requires_endpoint() {
		let app = app();
		let (status, _, body) = send(
			&app,
			Request::get("/v1/quote?tokens=5").body(Body::empty()).unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(error_code(&body), "invalid_request");
	}

	#[tokio::test]
	async fn test_quote_rejects_non_numeric_units() {
		let app = app();
		let (status, _, _) = send(
			&app,
			Request::get("/v1/quote?endpoint=summarize&tokens=lots")
				.body(Body::empty())
				.unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn test_paycall_then_job_lookup() {
		let app = app();
		let quote = quote(&app, "endpoint=compute").await;
		let quote_id = quote["quote_id"].as_str().unwrap();

		let (status, _, body) = send(
			&app,
			paycall(quote_id, "compute", json!({"operation": "square", "value": 10}), None),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		let body: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(body["status"], json!("ok"));
		assert_eq!(body["result"]["output"], json!(100));

		let job_id = body["receipt"]["job_id"].as_str().unwrap();
		let (status, _, job) = send(
			&app,
			Request::get(format!("/v1/jobs/{job_id}"))
				.body(Body::empty())
				.unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		let job: Value = serde_json::from_slice(&job).unwrap();
		assert_eq!(job["status"], json!("completed"));
	}

	#[tokio::test]
	async fn test_second_use_of_quote_conflicts() {
		let app = app();
		let quote = quote(&app, "endpoint=compute").await;
		let quote_id = quote["quote_id"].as_str().unwrap();
		let args = json!({"operation": "double", "value": 1});

		let (status, _, _) = send(&app, paycall(quote_id, "compute", args.clone(), None)).await;
		assert_eq!(status, StatusCode::OK);

		let (status, _, body) = send(&app, paycall(quote_id, "compute", args, None)).await;
		assert_eq!(status, StatusCode::CONFLICT);
		assert_eq!(error_code(&body), "expired_or_missing_quote");
	}

	#[tokio::test]
	async fn test_unknown_quote_conflicts() {
		let app = app();
		let (status, _, body) = send(&app, paycall("nope", "compute", json!({}), None)).await;
		assert_eq!(status, StatusCode::CONFLICT);
		assert_eq!(error_code(&body), "expired_or_missing_quote");
	}

	#[tokio::test]
	async fn test_endpoint_mismatch() {
		let app = app();
		let quote = quote(&app, "endpoint=compute").await;
		let (status, _, body) = send(
			&app,
			paycall(
				quote["quote_id"].as_str().unwrap(),
				"generate_image",
				json!({"prompt": "x"}),
				None,
			),
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(error_code(&body), "endpoint_mismatch");
	}

	#[tokio::test]
	async fn test_rejected_payment_is_402_with_reason() {
		let app = app();
		let quote = quote(&app, "endpoint=compute").await;
		let body = format!(
			r#"{{"quote_id":"{}","payment_claim":{{"spend_blob":"","proof":""}},"request":{{"endpoint":"compute","args":{{}}}}}}"#,
			quote["quote_id"].as_str().unwrap()
		);
		let (status, _, body) = send(
			&app,
			Request::post("/v1/paycall")
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(body))
				.unwrap(),
		)
		.await;

		assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
		let body: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(body["error"], json!("payment_invalid"));
		assert_eq!(body["details"]["reason"], json!("missing_payment_data"));
	}

	#[tokio::test]
	async fn test_failed_job_is_500() {
		let app = app();
		let quote = quote(&app, "endpoint=summarize&tokens=100").await;
		let (status, _, body) = send(
			&app,
			paycall(quote["quote_id"].as_str().unwrap(), "summarize", json!({}), Some("k1")),
		)
		.await;

		assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
		let body: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(body["error"], json!("job_execution_failed"));
		assert!(body["details"]["job_id"].is_string());
	}

	#[tokio::test]
	async fn test_replay_is_byte_identical() {
		let app = app();
		let quote = quote(&app, "endpoint=compute").await;
		let quote_id = quote["quote_id"].as_str().unwrap();

		let (status, headers, first) = send(
			&app,
			paycall(quote_id, "compute", json!({"operation": "square", "value": 3}), Some("abc")),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert!(headers.get(IDEMPOTENT_REPLAY).is_none());

		let garbage = Request::post("/v1/paycall")
			.header("Idempotency-Key", "abc")
			.body(Body::from("not json"))
			.unwrap();
		let (status, headers, second) = send(&app, garbage).await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(headers.get(IDEMPOTENT_REPLAY).unwrap(), "true");
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn test_malformed_body_is_400() {
		let app = app();
		let (status, _, body) = send(
			&app,
			Request::post("/v1/paycall").body(Body::from("{")).unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(error_code(&body), "invalid_request");
	}

	#[tokio::test]
	async fn test_missing_job_is_404() {
		let app = app();
		let (status, _, body) = send(
			&app,
			Request::get("/v1/jobs/missing").body(Body::empty()).unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert_eq!(error_code(&body), "job_not_found");
	}

	#[tokio::test]
	async fn test_health() {
		let app = app();
		let (status, _, body) = send(
			&app,
			Request::get("/health").body(Body::empty()).unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		let body: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(body["status"], json!("ok"));
		assert_eq!(body["verifier"]["name"], json!("structural"));
	}
}
