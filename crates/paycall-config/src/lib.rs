//! Configuration module for the paycall service.
//!
//! Loads the service configuration from TOML, resolving `${VAR}` and
//! `${VAR:-default}` references against the process environment before
//! parsing, and validates the result so the builder can assume a coherent
//! configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
pub mod builders;

#[cfg(any(test, feature = "testing"))]
pub use builders::config::ConfigBuilder;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		ConfigError::Parse(err.message().to_string())
	}
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this service instance.
	pub service: ServiceConfig,
	/// Storage backend selection.
	pub storage: StorageConfig,
	/// Payment verifier selection.
	pub verifier: VerifierConfig,
	#[serde(default)]
	pub quotes: QuoteConfig,
	#[serde(default)]
	pub idempotency: IdempotencyConfig,
	#[serde(default)]
	pub jobs: JobConfig,
	/// Per-endpoint pricing overrides, keyed by endpoint name.
	///
	/// Each table is validated by the pricing crate's schema when the
	/// pricing table is built.
	#[serde(default)]
	pub pricing: HashMap<String, toml::Value>,
	/// HTTP API server settings.
	pub api: Option<ApiConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	/// Unique identifier used in logs.
	pub id: String,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Name of the implementation to use.
	pub primary: String,
	/// Implementation-specific tables, keyed by implementation name.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval between sweeper passes.
	#[serde(default = "default_cleanup_interval_seconds")]
	pub cleanup_interval_seconds: u64,
}

/// Payment verifier configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifierConfig {
	pub primary: String,
	pub implementations: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuoteConfig {
	/// How long an issued quote stays payable.
	#[serde(default = "default_quote_ttl_seconds")]
	pub ttl_seconds: u64,
}

impl Default for QuoteConfig {
	fn default() -> Self {
		Self {
			ttl_seconds: default_quote_ttl_seconds(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdempotencyConfig {
	/// Lifetime of reservations and cached responses.
	#[serde(default = "default_idempotency_ttl_seconds")]
	pub ttl_seconds: u64,
}

impl Default for IdempotencyConfig {
	fn default() -> Self {
		Self {
			ttl_seconds: default_idempotency_ttl_seconds(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
	/// Upper bound on a single handler execution.
	#[serde(default = "default_job_timeout_seconds")]
	pub timeout_seconds: u64,
}

impl Default for JobConfig {
	fn default() -> Self {
		Self {
			timeout_seconds: default_job_timeout_seconds(),
		}
	}
}

/// HTTP API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	/// Whether the API server is enabled.
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_api_host")]
	pub host: String,
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Maximum request body size in bytes.
	#[serde(default = "default_max_request_size")]
	pub max_request_size: usize,
	pub cors: Option<CorsConfig>,
}

impl Default for ApiConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			host: default_api_host(),
			port: default_api_port(),
			max_request_size: default_max_request_size(),
			cors: None,
		}
	}
}

/// CORS configuration for the API server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
	/// Allowed origins; `*` allows any.
	#[serde(default)]
	pub allowed_origins: Vec<String>,
}

fn default_cleanup_interval_seconds() -> u64 {
	10
}

fn default_quote_ttl_seconds() -> u64 {
	30
}

fn default_idempotency_ttl_seconds() -> u64 {
	120
}

fn default_job_timeout_seconds() -> u64 {
	10
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

fn default_max_request_size() -> usize {
	1024 * 1024
}

/// Replaces `${VAR}` and `${VAR:-default}` references with environment values.
///
/// A reference without a default whose variable is unset is a validation
/// error.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = String::with_capacity(input.len());
	let mut last = 0;

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let var_name = var_name.as_str();

		let value = match std::env::var(var_name) {
			Ok(v) => v,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name
					)));
				},
			},
		};

		result.push_str(&input[last..full_match.start()]);
		result.push_str(&value);
		last = full_match.end();
	}
	result.push_str(&input[last..]);

	Ok(result)
}

impl Config {
	/// Loads configuration from a TOML file.
	pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let content = tokio::fs::read_to_string(path.as_ref()).await?;
		content.parse()
	}

	/// Checks cross-field constraints serde cannot express.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.service.id.is_empty() {
			return Err(ConfigError::Validation("Service ID cannot be empty".into()));
		}

		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}
		if self.storage.cleanup_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds must be greater than 0".into(),
			));
		}
		if self.storage.cleanup_interval_seconds > 86400 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds cannot exceed 86400 (24 hours)".into(),
			));
		}

		if !self
			.verifier
			.implementations
			.contains_key(&self.verifier.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary verifier '{}' not found in implementations",
				self.verifier.primary
			)));
		}

		if self.quotes.ttl_seconds == 0 {
			return Err(ConfigError::Validation(
				"quotes.ttl_seconds must be greater than 0".into(),
			));
		}
		if self.idempotency.ttl_seconds == 0 {
			return Err(ConfigError::Validation(
				"idempotency.ttl_seconds must be greater than 0".into(),
			));
		}
		if self.jobs.timeout_seconds == 0 {
			return Err(ConfigError::Validation(
				"jobs.timeout_seconds must be greater than 0".into(),
			));
		}

		for (endpoint, rule) in &self.pricing {
			let block_size = rule
				.get("block_size")
				.and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)));
			if let Some(block_size) = block_size {
				if block_size <= 0.0 {
					return Err(ConfigError::Validation(format!(
						"pricing.{}.block_size must be positive",
						endpoint
					)));
				}
			}
		}

		Ok(())
	}
}

impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
