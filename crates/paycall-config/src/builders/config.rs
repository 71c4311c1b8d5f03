//! Configuration builder for tests and embedded use.
//!
//! Produces a valid [`Config`] backed by in-memory storage and the structural
//! verifier without going through a TOML file.

use crate::{
	ApiConfig, Config, IdempotencyConfig, JobConfig, QuoteConfig, ServiceConfig, StorageConfig,
	VerifierConfig,
};
use std::collections::HashMap;

/// Builder for creating `Config` instances with a fluent API.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	service_id: String,
	storage_primary: String,
	storage_config: toml::Value,
	cleanup_interval_seconds: u64,
	receiver: String,
	locator: String,
	quote_ttl_seconds: u64,
	idempotency_ttl_seconds: u64,
	job_timeout_seconds: u64,
	pricing: HashMap<String, toml::Value>,
	api: Option<ApiConfig>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	pub fn new() -> Self {
		Self {
			service_id: "test-paycall".to_string(),
			storage_primary: "memory".to_string(),
			storage_config: toml::Value::Table(toml::map::Map::new()),
			cleanup_interval_seconds: 60,
			receiver: "npub1testreceiver".to_string(),
			locator: "ark://localhost:7070".to_string(),
			quote_ttl_seconds: 30,
			idempotency_ttl_seconds: 120,
			job_timeout_seconds: 5,
			pricing: HashMap::new(),
			api: None,
		}
	}

	pub fn service_id(mut self, id: impl Into<String>) -> Self {
		self.service_id = id.into();
		self
	}

	/// Selects the primary storage implementation and its configuration table.
	pub fn storage(mut self, primary: impl Into<String>, config: toml::Value) -> Self {
		self.storage_primary = primary.into();
		self.storage_config = config;
		self
	}

	pub fn cleanup_interval_seconds(mut self, interval: u64) -> Self {
		self.cleanup_interval_seconds = interval;
		self
	}

	/// Sets the payee the structural verifier reports.
	pub fn settlement_target(mut self, receiver: impl Into<String>, locator: impl Into<String>) -> Self {
		self.receiver = receiver.into();
		self.locator = locator.into();
		self
	}

	pub fn quote_ttl_seconds(mut self, ttl: u64) -> Self {
		self.quote_ttl_seconds = ttl;
		self
	}

	pub fn idempotency_ttl_seconds(mut self, ttl: u64) -> Self {
		self.idempotency_ttl_seconds = ttl;
		self
	}

	pub fn job_timeout_seconds(mut self, timeout: u64) -> Self {
		self.job_timeout_seconds = timeout;
		self
	}

	/// Adds a `[pricing.<endpoint>]` table.
	pub fn pricing_rule(mut self, endpoint: impl Into<String>, rule: toml::Value) -> Self {
		self.pricing.insert(endpoint.into(), rule);
		self
	}

	pub fn api(mut self, api: Option<ApiConfig>) -> Self {
		self.api = api;
		self
	}

	pub fn build(self) -> Config {
		let mut verifier = toml::map::Map::new();
		verifier.insert("receiver".into(), toml::Value::String(self.receiver));
		verifier.insert("locator".into(), toml::Value::String(self.locator));

		Config {
			service: ServiceConfig {
				id: self.service_id,
			},
			storage: StorageConfig {
				implementations: HashMap::from([(self.storage_primary.clone(), self.storage_config)]),
				primary: self.storage_primary,
				cleanup_interval_seconds: self.cleanup_interval_seconds,
			},
			verifier: VerifierConfig {
				primary: "structural".to_string(),
				implementations: HashMap::from([(
					"structural".to_string(),
					toml::Value::Table(verifier),
				)]),
			},
			quotes: QuoteConfig {
				ttl_seconds: self.quote_ttl_seconds,
			},
			idempotency: IdempotencyConfig {
				ttl_seconds: self.idempotency_ttl_seconds,
			},
			jobs: JobConfig {
				timeout_seconds: self.job_timeout_seconds,
			},
			pricing: self.pricing,
			api: self.api,
		}
	}
}
