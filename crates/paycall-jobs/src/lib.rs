//! Job handlers for the paycall system.
//!
//! A handler performs the unit of work behind one endpoint. Handlers are
//! collected into a [`HandlerRegistry`] once at startup and looked up by
//! endpoint name when a settled payment's job runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod handlers;

/// Errors a handler can report. They end up as the job's error description.
#[derive(Debug, Error)]
pub enum JobError {
	/// The caller's arguments are missing a field or have the wrong shape.
	#[error("Invalid arguments: {0}")]
	InvalidArguments(String),
	/// The work itself failed.
	#[error("Execution failed: {0}")]
	Execution(String),
}

/// Contract every endpoint handler satisfies.
#[async_trait]
pub trait JobHandler: Send + Sync {
	/// Runs the work for the given caller arguments and returns its result.
	async fn execute(&self, args: &Value) -> Result<Value, JobError>;
}

/// Endpoint name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
	handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registry with every built-in handler.
	pub fn builtin() -> Self {
		use handlers::{compute, media, text};

		Self::new()
			.with_handler("summarize", text::Summarize)
			.with_handler("translate", text::Translate)
			.with_handler("generate_image", media::GenerateImage)
			.with_handler("transcribe", media::Transcribe)
			.with_handler("compute", compute::Compute)
	}

	pub fn with_handler(mut self, endpoint: &str, handler: impl JobHandler + 'static) -> Self {
		self.handlers.insert(endpoint.to_string(), Arc::new(handler));
		self
	}

	pub fn get(&self, endpoint: &str) -> Option<Arc<dyn JobHandler>> {
		self.handlers.get(endpoint).cloned()
	}

	/// Registered endpoint names, sorted.
	pub fn endpoints(&self) -> Vec<&str> {
		let mut endpoints: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
		endpoints.sort_unstable();
		endpoints
	}
}

impl std::fmt::Debug for HandlerRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HandlerRegistry")
			.field("endpoints", &self.endpoints())
			.finish()
	}
}

/// Reads a required non-empty string argument.
pub(crate) fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, JobError> {
	match args.get(field).and_then(Value::as_str) {
		Some(s) if !s.trim().is_empty() => Ok(s),
		Some(_) => Err(JobError::InvalidArguments(format!("'{}' must not be empty", field))),
		None => Err(JobError::InvalidArguments(format!(
			"missing required string field '{}'",
			field
		))),
	}
}
