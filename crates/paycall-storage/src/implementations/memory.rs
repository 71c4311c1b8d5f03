//! In-memory storage backend.
//!
//! Keeps every record in a `HashMap` behind a read-write lock. Suitable for
//! tests and single-process deployments that can afford to lose state on
//! restart.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry, WriteBatch, WriteOp};
use async_trait::async_trait;
use paycall_types::{ConfigSchema, ImplementationRegistry, Schema, ValidationError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
	value: Vec<u8>,
	expires_at: Option<Instant>,
}

impl Entry {
	fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
		Self {
			value,
			expires_at: ttl.filter(|t| !t.is_zero()).map(|t| Instant::now() + t),
		}
	}

	fn is_live(&self, now: Instant) -> bool {
		self.expires_at.is_none_or(|at| now < at)
	}
}

/// In-memory storage implementation.
pub struct MemoryStorage {
	store: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self {
			store: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let store = self.store.read().await;
		store
			.get(key)
			.filter(|entry| entry.is_live(Instant::now()))
			.map(|entry| entry.value.clone())
			.ok_or(StorageError::NotFound)
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		store.insert(key.to_string(), Entry::new(value, ttl));
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		store.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let store = self.store.read().await;
		Ok(store.get(key).is_some_and(|e| e.is_live(Instant::now())))
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let store = self.store.read().await;
		let now = Instant::now();
		Ok(store
			.iter()
			.filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
			.map(|(key, _)| key.clone())
			.collect())
	}

	async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		let now = Instant::now();

		for precondition in &batch.preconditions {
			let current = store
				.get(precondition.key())
				.filter(|e| e.is_live(now))
				.map(|e| e.value.as_slice());
			if !precondition.holds(current) {
				return Err(StorageError::Conflict(format!(
					"precondition failed for {}",
					precondition.key()
				)));
			}
		}

		for write in batch.writes {
			match write {
				WriteOp::Put { key, value, ttl } => {
					store.insert(key, Entry::new(value, ttl));
				},
				WriteOp::Delete { key } => {
					store.remove(&key);
				},
			}
		}
		Ok(())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let mut store = self.store.write().await;
		let now = Instant::now();
		let before = store.len();
		store.retain(|_, entry| entry.is_live(now));
		Ok(before - store.len())
	}
}

/// Configuration schema for MemoryStorage.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Memory storage has no configuration
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory storage backend from configuration.
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	MemoryStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;
	Ok(Box::new(MemoryStorage::new()))
}

/// Registry for the memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Precondition;

	#[tokio::test]
	async fn test_basic_operations() {
		let storage = MemoryStorage::new();

		let key = "test_key";
		let value = b"test_value".to_vec();
		storage.set_bytes(key, value.clone(), None).await.unwrap();

		assert_eq!(storage.get_bytes(key).await.unwrap(), value);
		assert!(storage.exists(key).await.unwrap());

		storage.delete(key).await.unwrap();
		assert!(!storage.exists(key).await.unwrap());
		assert!(matches!(
			storage.get_bytes(key).await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_expired_entries_are_invisible_before_cleanup() {
		let storage = MemoryStorage::new();
		storage
			.set_bytes("idempotency:k", b"cached".to_vec(), Some(Duration::from_secs(120)))
			.await
			.unwrap();
		storage.set_bytes("quotes:q", b"q".to_vec(), None).await.unwrap();

		tokio::time::advance(Duration::from_secs(119)).await;
		assert!(storage.exists("idempotency:k").await.unwrap());

		tokio::time::advance(Duration::from_secs(2)).await;
		assert!(matches!(
			storage.get_bytes("idempotency:k").await,
			Err(StorageError::NotFound)
		));
		assert_eq!(storage.list_keys("idempotency:").await.unwrap().len(), 0);

		assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
		assert!(storage.exists("quotes:q").await.unwrap());
	}

	#[tokio::test]
	async fn test_commit_is_all_or_nothing() {
		let storage = MemoryStorage::new();
		storage.set_bytes("a", b"1".to_vec(), None).await.unwrap();

		let batch = WriteBatch {
			preconditions: vec![
				Precondition::ValueEquals {
					key: "a".into(),
					expected: b"1".to_vec(),
				},
				Precondition::KeyAbsent("a".into()),
			],
			writes: vec![WriteOp::Put {
				key: "b".into(),
				value: b"2".to_vec(),
				ttl: None,
			}],
		};
		assert!(matches!(
			storage.commit(batch).await,
			Err(StorageError::Conflict(_))
		));
		assert!(!storage.exists("b").await.unwrap());

		let batch = WriteBatch {
			preconditions: vec![Precondition::KeyAbsent("b".into())],
			writes: vec![
				WriteOp::Put {
					key: "b".into(),
					value: b"2".to_vec(),
					ttl: None,
				},
				WriteOp::Delete { key: "a".into() },
			],
		};
		storage.commit(batch).await.unwrap();
		assert!(storage.exists("b").await.unwrap());
		assert!(!storage.exists("a").await.unwrap());
	}

	#[test]
	fn test_factory_rejects_unknown_shape() {
		assert!(create_storage(&toml::Value::Table(Default::default())).is_ok());
		assert!(create_storage(&toml::Value::String("nope".into())).is_err());
	}
}
