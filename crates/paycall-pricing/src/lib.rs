//! Pricing module for the paycall system.
//!
//! Maps endpoint names to pricing rules. A rule prices one unit kind in
//! blocks: `ceil(units / block_size) * sats_per_block`, so prices are
//! deterministic, never decrease as units grow, and never undercharge a
//! partial block. Endpoints without a rule fall back to a generic per-amount
//! rule.

use paycall_types::{ConfigSchema, Field, FieldType, Schema, UnitCounts, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during pricing.
#[derive(Debug, Error)]
pub enum PricingError {
	/// A unit count is negative or not a finite number.
	#[error("Invalid units: {0}")]
	InvalidUnits(String),
	/// A configured pricing rule is malformed.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Pricing rule for a single endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
	/// Unit kind this rule charges for (e.g. "tokens").
	pub unit: String,
	/// Units per charged block. Always positive.
	pub block_size: f64,
	/// Price of one block in sats.
	pub sats_per_block: u64,
	/// Units assumed when the caller does not say.
	pub default_units: f64,
}

impl PricingRule {
	pub fn new(unit: &str, block_size: f64, sats_per_block: u64, default_units: f64) -> Self {
		Self {
			unit: unit.to_string(),
			block_size,
			sats_per_block,
			default_units,
		}
	}

	/// Price for `units` of this rule's unit kind.
	pub fn price(&self, units: f64) -> u64 {
		let blocks = (units / self.block_size).ceil();
		// `as` saturates for out-of-range floats.
		(blocks as u64).saturating_mul(self.sats_per_block)
	}
}

/// Units and price resolved for a quote.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceBreakdown {
	/// Caller's units with the rule's default filled in when absent.
	pub units: UnitCounts,
	pub price_sats: u64,
}

/// Endpoint name to pricing rule, built once at startup.
#[derive(Debug, Clone)]
pub struct PricingTable {
	rules: HashMap<String, PricingRule>,
	fallback: PricingRule,
}

impl PricingTable {
	/// The reference table: summarize, translate, generate_image, transcribe, compute.
	pub fn builtin() -> Self {
		let rules = HashMap::from([
			("summarize".to_string(), PricingRule::new("tokens", 100.0, 5, 1000.0)),
			("translate".to_string(), PricingRule::new("characters", 1000.0, 10, 1000.0)),
			("generate_image".to_string(), PricingRule::new("images", 1.0, 50, 1.0)),
			("transcribe".to_string(), PricingRule::new("seconds", 60.0, 20, 60.0)),
			("compute".to_string(), PricingRule::new("amount", 1.0, 1, 1.0)),
		]);
		Self {
			rules,
			fallback: PricingRule::new("amount", 1.0, 1, 1.0),
		}
	}

	/// Builtin table with `[pricing.<endpoint>]` tables applied on top.
	pub fn from_config(overrides: &HashMap<String, toml::Value>) -> Result<Self, PricingError> {
		let mut table = Self::builtin();
		for (endpoint, config) in overrides {
			PricingRuleSchema.validate(config).map_err(|e| {
				PricingError::Configuration(format!("pricing.{}: {}", endpoint, e))
			})?;
			let rule: PricingRule = config.clone().try_into().map_err(|e: toml::de::Error| {
				PricingError::Configuration(format!("pricing.{}: {}", endpoint, e.message()))
			})?;
			tracing::debug!(endpoint = %endpoint, unit = %rule.unit, "Loaded pricing rule");
			table = table.with_rule(endpoint, rule);
		}
		Ok(table)
	}

	pub fn with_rule(mut self, endpoint: &str, rule: PricingRule) -> Self {
		self.rules.insert(endpoint.to_string(), rule);
		self
	}

	/// Rule for `endpoint`, or the generic per-amount rule.
	pub fn rule_for(&self, endpoint: &str) -> &PricingRule {
		self.rules.get(endpoint).unwrap_or(&self.fallback)
	}

	/// Endpoints with a dedicated rule, sorted.
	pub fn endpoints(&self) -> Vec<&str> {
		let mut endpoints: Vec<&str> = self.rules.keys().map(String::as_str).collect();
		endpoints.sort_unstable();
		endpoints
	}

	/// Prices a call to `endpoint` with the given unit counts.
	pub fn price(&self, endpoint: &str, units: &UnitCounts) -> Result<PriceBreakdown, PricingError> {
		if let Some((kind, value)) = units.iter().find(|(_, v)| !v.is_finite() || **v < 0.0) {
			return Err(PricingError::InvalidUnits(format!(
				"{} must be a non-negative number, got {}",
				kind, value
			)));
		}

		let rule = self.rule_for(endpoint);
		let mut resolved = units.clone();
		let quantity = *resolved
			.entry(rule.unit.clone())
			.or_insert(rule.default_units);

		Ok(PriceBreakdown {
			units: resolved,
			price_sats: rule.price(quantity),
		})
	}
}

/// Configuration schema for a `[pricing.<endpoint>]` table.
pub struct PricingRuleSchema;

impl ConfigSchema for PricingRuleSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![
				Field::new("unit", FieldType::String),
				Field::new("block_size", FieldType::Number { min: Some(f64::MIN_POSITIVE) }),
				Field::new(
					"sats_per_block",
					FieldType::Integer {
						min: Some(0),
						max: None,
					},
				),
				Field::new("default_units", FieldType::Number { min: Some(0.0) }),
			],
			vec![],
		)
		.validate(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn units(pairs: &[(&str, f64)]) -> UnitCounts {
		pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
	}

	#[test]
	fn test_summarize_charges_per_hundred_tokens() {
		let table = PricingTable::builtin();
		let priced = table
			.price("summarize", &units(&[("tokens", 1000.0)]))
			.unwrap();
		assert_eq!(priced.price_sats, 50);

		let priced = table.price("summarize", &units(&[("tokens", 101.0)])).unwrap();
		assert_eq!(priced.price_sats, 10);
	}

	#[test]
	fn test_generate_image_charges_per_image() {
		let priced = PricingTable::builtin()
			.price("generate_image", &units(&[("images", 3.0)]))
			.unwrap();
		assert_eq!(priced.price_sats, 150);
	}

	#[test]
	fn test_defaults_fill_missing_unit() {
		let priced = PricingTable::builtin()
			.price("summarize", &UnitCounts::new())
			.unwrap();
		assert_eq!(priced.units, units(&[("tokens", 1000.0)]));
		assert_eq!(priced.price_sats, 50);
	}

	#[test]
	fn test_unknown_endpoint_uses_amount_rule() {
		let priced = PricingTable::builtin()
			.price("embed", &units(&[("amount", 2.5)]))
			.unwrap();
		assert_eq!(priced.price_sats, 3);
	}

	#[test]
	fn test_rejects_negative_and_non_finite_units() {
		let table = PricingTable::builtin();
		assert!(matches!(
			table.price("summarize", &units(&[("tokens", -1.0)])),
			Err(PricingError::InvalidUnits(_))
		));
		assert!(matches!(
			table.price("summarize", &units(&[("images", f64::NAN)])),
			Err(PricingError::InvalidUnits(_))
		));
	}

	#[test]
	fn test_price_is_deterministic_and_monotonic() {
		let table = PricingTable::builtin();
		for endpoint in ["summarize", "translate", "generate_image", "transcribe", "compute", "other"] {
			let unit = table.rule_for(endpoint).unit.clone();
			let mut last = 0;
			for step in 0..500 {
				let count = step as f64 * 7.3;
				let a = table.price(endpoint, &units(&[(&unit, count)])).unwrap();
				let b = table.price(endpoint, &units(&[(&unit, count)])).unwrap();
				assert_eq!(a.price_sats, b.price_sats);
				assert!(a.price_sats >= last, "{} not monotonic at {}", endpoint, count);
				last = a.price_sats;
			}
		}
	}

	#[test]
	fn test_config_overrides_and_validates() {
		let mut overrides = HashMap::new();
		overrides.insert(
			"summarize".to_string(),
			toml::from_str::<toml::Value>(
				"unit = \"tokens\"\nblock_size = 1000\nsats_per_block = 7\ndefault_units = 500",
			)
			.unwrap(),
		);
		let table = PricingTable::from_config(&overrides).unwrap();
		assert_eq!(table.rule_for("summarize").sats_per_block, 7);
		assert_eq!(
			table
				.price("summarize", &units(&[("tokens", 1500.0)]))
				.unwrap()
				.price_sats,
			14
		);

		overrides.insert(
			"broken".to_string(),
			toml::from_str::<toml::Value>("unit = \"x\"\nblock_size = 0\nsats_per_block = 1\ndefault_units = 1").unwrap(),
		);
		assert!(matches!(
			PricingTable::from_config(&overrides),
			Err(PricingError::Configuration(_))
		));
	}
}
