//! Storage module for the paycall system.
//!
//! This module provides the persistence layer for quotes, payments, jobs and
//! idempotency entries. Backends implement a small byte-oriented key-value
//! interface with TTLs, conditional writes and atomic batches; the
//! [`StorageService`] layers typed JSON access and transactions on top.

use async_trait::async_trait;
use paycall_types::{ConfigSchema, ImplementationRegistry};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested item is not found.
	#[error("Not found")]
	NotFound,
	/// A batch precondition did not hold; nothing was written.
	#[error("Conflict: {0}")]
	Conflict(String),
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Condition that must hold for a [`WriteBatch`] to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
	/// No live value exists under the key.
	KeyAbsent(String),
	/// The live value under the key equals `expected` byte-for-byte.
	ValueEquals { key: String, expected: Vec<u8> },
}

impl Precondition {
	pub fn key(&self) -> &str {
		match self {
			Precondition::KeyAbsent(key) => key,
			Precondition::ValueEquals { key, .. } => key,
		}
	}

	/// Checks the precondition against the current live value of its key.
	pub fn holds(&self, current: Option<&[u8]>) -> bool {
		match self {
			Precondition::KeyAbsent(_) => current.is_none(),
			Precondition::ValueEquals { expected, .. } => current == Some(expected.as_slice()),
		}
	}
}

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
	Put {
		key: String,
		value: Vec<u8>,
		ttl: Option<Duration>,
	},
	Delete {
		key: String,
	},
}

/// Preconditions plus writes, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
	pub preconditions: Vec<Precondition>,
	pub writes: Vec<WriteOp>,
}

/// Trait defining the low-level interface for storage backends.
///
/// Reads never observe TTL-expired values, whether or not the backend has
/// physically removed them yet.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes with optional time-to-live.
	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>;

	/// Deletes the value associated with the given key.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Checks if a live value exists for the key.
	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Lists live keys starting with `prefix`.
	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

	/// Applies the batch atomically.
	///
	/// Returns [`StorageError::Conflict`] without writing anything when any
	/// precondition fails.
	async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Removes expired entries from storage, returning how many were removed.
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0)
	}

	/// Finishes batches a crash interrupted after their commit point.
	///
	/// Called once at startup before serving. Returns how many batches were
	/// completed. Backends whose commits cannot be torn keep the default.
	async fn recover(&self) -> Result<usize, StorageError> {
		Ok(0)
	}
}

/// Type alias for storage factory functions.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Get all registered storage implementations as (name, factory) pairs.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

fn make_key(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

fn encode<T: Serialize>(data: &T) -> Result<Vec<u8>, StorageError> {
	serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
	serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// A typed value together with the exact bytes it was read from.
///
/// Passing a snapshot to [`Transaction::expect_unchanged`] makes a commit
/// conditional on nobody having rewritten the record since it was read.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
	pub value: T,
	raw: Vec<u8>,
}

impl<T> Snapshot<T> {
	pub fn into_inner(self) -> T {
		self.value
	}
}

/// High-level storage service that provides typed operations.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Stores a serializable value under `namespace:id` with optional time-to-live.
	pub async fn store_with_ttl<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		self.backend
			.set_bytes(&make_key(namespace, id), encode(data)?, ttl)
			.await
	}

	/// Stores a serializable value without time-to-live.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		self.store_with_ttl(namespace, id, data, None).await
	}

	/// Retrieves and deserializes a value from storage.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&make_key(namespace, id)).await?;
		decode(&bytes)
	}

	/// Retrieves a value along with the bytes it was stored as.
	pub async fn retrieve_snapshot<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Snapshot<T>, StorageError> {
		let raw = self.backend.get_bytes(&make_key(namespace, id)).await?;
		let value = decode(&raw)?;
		Ok(Snapshot { value, raw })
	}

	/// Retrieves every live value in a namespace, paired with its id.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		Ok(self
			.retrieve_all_snapshots(namespace)
			.await?
			.into_iter()
			.map(|(id, snapshot)| (id, snapshot.value))
			.collect())
	}

	/// Like [`retrieve_all`](Self::retrieve_all), keeping the stored bytes.
	///
	/// Entries that disappear between listing and reading are skipped.
	pub async fn retrieve_all_snapshots<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, Snapshot<T>)>, StorageError> {
		let prefix = make_key(namespace, "");
		let mut values = Vec::new();
		for key in self.backend.list_keys(&prefix).await? {
			let raw = match self.backend.get_bytes(&key).await {
				Ok(bytes) => bytes,
				Err(StorageError::NotFound) => continue,
				Err(e) => return Err(e),
			};
			let value = decode(&raw)?;
			values.push((key[prefix.len()..].to_string(), Snapshot { value, raw }));
		}
		Ok(values)
	}

	/// Removes a value from storage.
	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&make_key(namespace, id)).await
	}

	/// Overwrites an existing value; fails with `NotFound` if there is none.
	pub async fn update<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let key = make_key(namespace, id);
		if !self.backend.exists(&key).await? {
			return Err(StorageError::NotFound);
		}
		self.backend.set_bytes(&key, encode(data)?, None).await
	}

	/// Checks if a value exists in storage.
	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&make_key(namespace, id)).await
	}

	/// Removes backend-level expired entries; returns how many were removed.
	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}

	/// Completes commits interrupted by a crash; returns how many.
	pub async fn recover(&self) -> Result<usize, StorageError> {
		self.backend.recover().await
	}

	/// Starts an atomic multi-record write.
	pub fn transaction(&self) -> Transaction<'_> {
		Transaction {
			backend: self.backend.as_ref(),
			batch: WriteBatch::default(),
		}
	}
}

/// Typed builder for a [`WriteBatch`].
pub struct Transaction<'a> {
	backend: &'a dyn StorageInterface,
	batch: WriteBatch,
}

impl Transaction<'_> {
	/// Requires that no live record exists under `namespace:id`.
	pub fn expect_absent(mut self, namespace: &str, id: &str) -> Self {
		self.batch
			.preconditions
			.push(Precondition::KeyAbsent(make_key(namespace, id)));
		self
	}

	/// Requires that the record is still exactly as captured in `snapshot`.
	pub fn expect_unchanged<T>(mut self, namespace: &str, id: &str, snapshot: &Snapshot<T>) -> Self {
		self.batch.preconditions.push(Precondition::ValueEquals {
			key: make_key(namespace, id),
			expected: snapshot.raw.clone(),
		});
		self
	}

	/// Requires that the record currently holds exactly `data`, encoded the
	/// same way [`put`](Self::put) encodes it.
	///
	/// # Arguments
	///
	/// * `namespace` - Record namespace
	/// * `id` - Record id within the namespace
	/// * `data` - Value the caller previously wrote
	pub fn expect_value<T: Serialize>(
		mut self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<Self, StorageError> {
		self.batch.preconditions.push(Precondition::ValueEquals {
			key: make_key(namespace, id),
			expected: encode(data)?,
		});
		Ok(self)
	}

	/// Queues a write of `data` under `namespace:id`.
	pub fn put<T: Serialize>(
		mut self,
		namespace: &str,
		id: &str,
		data: &T,
		ttl: Option<Duration>,
	) -> Result<Self, StorageError> {
		self.batch.writes.push(WriteOp::Put {
			key: make_key(namespace, id),
			value: encode(data)?,
			ttl,
		});
		Ok(self)
	}

	/// Queues removal of `namespace:id`.
	pub fn delete(mut self, namespace: &str, id: &str) -> Self {
		self.batch.writes.push(WriteOp::Delete {
			key: make_key(namespace, id),
		});
		self
	}

	/// Applies every write if and only if every precondition holds.
	pub async fn commit(self) -> Result<(), StorageError> {
		self.backend.commit(self.batch).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::memory::MemoryStorage;
	use serde::Deserialize;

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct Record {
		status: String,
	}

	fn service() -> StorageService {
		StorageService::new(Box::new(MemoryStorage::new()))
	}

	#[tokio::test]
	async fn test_typed_round_trip_and_update() {
		let storage = service();
		let record = Record {
			status: "active".into(),
		};

		assert!(matches!(
			storage.update("quotes", "q1", &record).await,
			Err(StorageError::NotFound)
		));

		storage.store("quotes", "q1", &record).await.unwrap();
		let loaded: Record = storage.retrieve("quotes", "q1").await.unwrap();
		assert_eq!(loaded, record);

		let used = Record {
			status: "used".into(),
		};
		storage.update("quotes", "q1", &used).await.unwrap();
		let loaded: Record = storage.retrieve("quotes", "q1").await.unwrap();
		assert_eq!(loaded, used);
	}

	#[tokio::test]
	async fn test_transaction_rejects_stale_snapshot() {
		let storage = service();
		storage
			.store("quotes", "q1", &Record { status: "active".into() })
			.await
			.unwrap();

		let first: Snapshot<Record> = storage.retrieve_snapshot("quotes", "q1").await.unwrap();
		let second: Snapshot<Record> = storage.retrieve_snapshot("quotes", "q1").await.unwrap();

		storage
			.transaction()
			.expect_unchanged("quotes", "q1", &first)
			.put("quotes", "q1", &Record { status: "used".into() }, None)
			.unwrap()
			.put("payments", "p1", &Record { status: "verified".into() }, None)
			.unwrap()
			.commit()
			.await
			.unwrap();

		let result = storage
			.transaction()
			.expect_unchanged("quotes", "q1", &second)
			.put("quotes", "q1", &Record { status: "used".into() }, None)
			.unwrap()
			.put("payments", "p2", &Record { status: "verified".into() }, None)
			.unwrap()
			.commit()
			.await;

		assert!(matches!(result, Err(StorageError::Conflict(_))));
		assert!(storage.exists("payments", "p1").await.unwrap());
		assert!(!storage.exists("payments", "p2").await.unwrap());
	}

	#[tokio::test]
	async fn test_conditional_delete_on_written_value() {
		let storage = service();
		let first = Record {
			status: "pending".into(),
		};
		storage.store("idempotency", "k", &first).await.unwrap();
		storage
			.store("idempotency", "k", &Record { status: "replaced".into() })
			.await
			.unwrap();

		let result = storage
			.transaction()
			.expect_value("idempotency", "k", &first)
			.unwrap()
			.delete("idempotency", "k")
			.commit()
			.await;
		assert!(matches!(result, Err(StorageError::Conflict(_))));
		assert!(storage.exists("idempotency", "k").await.unwrap());

		let current = Record {
			status: "replaced".into(),
		};
		storage
			.transaction()
			.expect_value("idempotency", "k", &current)
			.unwrap()
			.delete("idempotency", "k")
			.commit()
			.await
			.unwrap();
		assert!(!storage.exists("idempotency", "k").await.unwrap());
	}

	#[tokio::test]
	async fn test_retrieve_all_is_scoped_to_namespace() {
		let storage = service();
		storage
			.store("jobs", "j1", &Record { status: "queued".into() })
			.await
			.unwrap();
		storage
			.store("jobs", "j2", &Record { status: "failed".into() })
			.await
			.unwrap();
		storage
			.store("jobsx", "j3", &Record { status: "queued".into() })
			.await
			.unwrap();

		let mut jobs: Vec<(String, Record)> = storage.retrieve_all("jobs").await.unwrap();
		jobs.sort_by(|a, b| a.0.cmp(&b.0));
		let ids: Vec<_> = jobs.iter().map(|(id, _)| id.as_str()).collect();
		assert_eq!(ids, vec!["j1", "j2"]);
	}
}
