//! Storage-related types for the paycall system.

use std::str::FromStr;

/// Storage namespaces for the persisted relations.
///
/// Each record is stored under `<namespace>:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Issued quotes, keyed by quote id
	Quotes,
	/// Verified payments, keyed by payment id
	Payments,
	/// Jobs, keyed by job id
	Jobs,
	/// Idempotency entries, keyed by the caller-supplied key
	Idempotency,
}

impl StorageKey {
	/// Returns the string representation of the storage key.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Quotes => "quotes",
			StorageKey::Payments => "payments",
			StorageKey::Jobs => "jobs",
			StorageKey::Idempotency => "idempotency",
		}
	}

	/// Returns an iterator over all StorageKey variants.
	pub fn all() -> impl Iterator<Item = Self> {
		[Self::Quotes, Self::Payments, Self::Jobs, Self::Idempotency].into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"quotes" => Ok(Self::Quotes),
			"payments" => Ok(Self::Payments),
			"jobs" => Ok(Self::Jobs),
			"idempotency" => Ok(Self::Idempotency),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_namespace_names_parse_back() {
		for key in StorageKey::all() {
			assert_eq!(key.as_str().parse::<StorageKey>(), Ok(key));
		}
		assert!("orders".parse::<StorageKey>().is_err());
	}
}
