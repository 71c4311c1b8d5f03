//! Builder for constructing a [`PaycallEngine`].
//!
//! Storage and verifier implementations are created from factory maps keyed
//! by implementation name, so the binary decides which backends exist and the
//! configuration decides which one is primary.

use crate::{
	IdempotencyGate, JobExecutor, PaycallEngine, QuoteIssuer, RecoveryService, SettlementOrchestrator,
	StateStore, Sweeper,
};
use paycall_config::Config;
use paycall_jobs::HandlerRegistry;
use paycall_pricing::PricingTable;
use paycall_storage::{StorageFactory, StorageService};
use paycall_verifier::{VerifierFactory, VerifierService};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions the engine can draw implementations from.
#[derive(Default)]
pub struct PaycallFactories {
	pub storage_factories: HashMap<String, StorageFactory>,
	pub verifier_factories: HashMap<String, VerifierFactory>,
}

impl PaycallFactories {
	/// Every implementation shipped with the workspace.
	pub fn builtin() -> Self {
		Self {
			storage_factories: paycall_storage::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
			verifier_factories: paycall_verifier::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
		}
	}
}

pub struct PaycallBuilder {
	config: Config,
	handlers: HandlerRegistry,
}

impl PaycallBuilder {
	/// Starts a builder with the built-in job handlers.
	pub fn new(config: Config) -> Self {
		Self {
			config,
			handlers: HandlerRegistry::builtin(),
		}
	}

	/// Replaces the job handler registry.
	pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
		self.handlers = handlers;
		self
	}

	pub fn build(self, factories: PaycallFactories) -> Result<PaycallEngine, BuilderError> {
		let config = self.config;

		let storage_name = &config.storage.primary;
		let storage_config = config
			.storage
			.implementations
			.get(storage_name)
			.ok_or_else(|| {
				BuilderError::Config(format!(
					"Primary storage '{}' has no configuration",
					storage_name
				))
			})?;
		let storage_factory = factories.storage_factories.get(storage_name).ok_or_else(|| {
			BuilderError::MissingComponent(format!("storage implementation '{}'", storage_name))
		})?;
		let storage_backend = storage_factory(storage_config).map_err(|e| {
			tracing::error!(
				component = "storage",
				implementation = %storage_name,
				error = %e,
				"Failed to create storage implementation"
			);
			BuilderError::Config(format!(
				"Failed to create storage implementation '{}': {}",
				storage_name, e
			))
		})?;
		tracing::info!(component = "storage", implementation = %storage_name, "Loaded");

		let verifier_name = &config.verifier.primary;
		let verifier_config = config
			.verifier
			.implementations
			.get(verifier_name)
			.ok_or_else(|| {
				BuilderError::Config(format!(
					"Primary verifier '{}' has no configuration",
					verifier_name
				))
			})?;
		let verifier_factory = factories
			.verifier_factories
			.get(verifier_name)
			.ok_or_else(|| {
				BuilderError::MissingComponent(format!(
					"verifier implementation '{}'",
					verifier_name
				))
			})?;
		let verifier_impl = verifier_factory(verifier_config).map_err(|e| {
			tracing::error!(
				component = "verifier",
				implementation = %verifier_name,
				error = %e,
				"Failed to create verifier implementation"
			);
			BuilderError::Config(format!(
				"Failed to create verifier implementation '{}': {}",
				verifier_name, e
			))
		})?;
		tracing::info!(component = "verifier", implementation = %verifier_name, "Loaded");

		let pricing = PricingTable::from_config(&config.pricing)
			.map_err(|e| BuilderError::Config(e.to_string()))?;
		tracing::info!(component = "pricing", endpoints = ?pricing.endpoints(), "Loaded");

		for endpoint in pricing.endpoints() {
			if self.handlers.get(endpoint).is_none() {
				tracing::warn!(endpoint = %endpoint, "Priced endpoint has no job handler");
			}
		}

		let state = Arc::new(StateStore::new(Arc::new(StorageService::new(storage_backend))));
		let verifier = Arc::new(VerifierService::new(verifier_name.clone(), verifier_impl));
		let gate = Arc::new(IdempotencyGate::new(
			state.clone(),
			Duration::from_secs(config.idempotency.ttl_seconds),
		));
		let executor = Arc::new(JobExecutor::new(
			state.clone(),
			Arc::new(self.handlers),
			Duration::from_secs(config.jobs.timeout_seconds),
		));
		let issuer = Arc::new(QuoteIssuer::new(
			state.clone(),
			Arc::new(pricing),
			verifier.clone(),
			Duration::from_secs(config.quotes.ttl_seconds),
		));
		let orchestrator = Arc::new(SettlementOrchestrator::new(
			state.clone(),
			verifier.clone(),
			gate.clone(),
			executor,
		));
		let sweeper = Arc::new(Sweeper::new(
			state.clone(),
			gate,
			Duration::from_secs(config.storage.cleanup_interval_seconds),
		));
		let recovery = RecoveryService::new(state.clone());

		Ok(PaycallEngine {
			config,
			state,
			verifier,
			issuer,
			orchestrator,
			sweeper,
			recovery,
		})
	}
}
