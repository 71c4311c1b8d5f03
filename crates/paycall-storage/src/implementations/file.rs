//! File-based storage backend.
//!
//! Every key is stored as one file under the configured directory. A file is
//! a fixed header (expiry and key length), the key itself and then the value,
//! so TTLs survive restarts and names never need to be decoded. Keys whose
//! encoded name would be too long for the filesystem get a name derived from
//! a v5 UUID of the key instead.
//!
//! Single writes go to a temporary file that is renamed into place. A batch
//! with several writes is first written to a journal file whose rename is the
//! commit point; the writes are then applied and the journal removed. A
//! journal left behind by a crash is replayed by [`StorageInterface::recover`].
//! All mutations are serialized through one async mutex.

use crate::{
	StorageError, StorageFactory, StorageInterface, StorageRegistry, WriteBatch, WriteOp,
};
use async_trait::async_trait;
use paycall_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, StorageKey, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Longest file stem written before falling back to a hashed name.
const MAX_FILE_STEM: usize = 200;

/// Committed batch awaiting application.
const JOURNAL_FILE: &str = "commit.journal";

/// Journal being written; never applied.
const JOURNAL_TEMP_FILE: &str = "commit.journal.tmp";

fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or_default()
}

fn backend_err(e: impl std::fmt::Display) -> StorageError {
	StorageError::Backend(e.to_string())
}

/// Fixed-size file header.
///
/// Layout (32 bytes): magic "PCST", version (u16 LE), expiry in Unix
/// milliseconds (u64 LE, 0 = never), key length (u16 LE), zero padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileHeader {
	expires_at_ms: u64,
	key_len: u16,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"PCST";
	const VERSION: u16 = 1;
	const SIZE: usize = 32;

	fn serialize(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&Self::VERSION.to_le_bytes());
		bytes[6..14].copy_from_slice(&self.expires_at_ms.to_le_bytes());
		bytes[14..16].copy_from_slice(&self.key_len.to_le_bytes());
		bytes
	}

	fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
		if bytes.len() < Self::SIZE {
			return Err(StorageError::Backend("File too small for header".into()));
		}
		if &bytes[0..4] != Self::MAGIC {
			return Err(StorageError::Backend("Unrecognized file format".into()));
		}
		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"Unsupported file version: {}",
				version
			)));
		}
		let mut expires = [0u8; 8];
		expires.copy_from_slice(&bytes[6..14]);
		Ok(Self {
			expires_at_ms: u64::from_le_bytes(expires),
			key_len: u16::from_le_bytes([bytes[14], bytes[15]]),
		})
	}

	fn is_expired(&self) -> bool {
		self.expires_at_ms != 0 && now_millis() >= self.expires_at_ms
	}
}

/// One decoded file.
struct Record {
	key: String,
	header: FileHeader,
	value: Vec<u8>,
}

impl Record {
	fn parse(mut data: Vec<u8>) -> Result<Self, StorageError> {
		let header = FileHeader::deserialize(&data)?;
		let key_end = FileHeader::SIZE + header.key_len as usize;
		if data.len() < key_end {
			return Err(StorageError::Backend("File truncated inside key".into()));
		}
		let value = data.split_off(key_end);
		let key = String::from_utf8(data.split_off(FileHeader::SIZE))
			.map_err(|_| StorageError::Backend("Stored key is not UTF-8".into()))?;
		Ok(Self { key, header, value })
	}

	fn is_live(&self) -> bool {
		!self.header.is_expired()
	}
}

/// Expiry in Unix milliseconds for a write made now; 0 means never.
fn expires_at(ttl: Duration) -> u64 {
	if ttl.is_zero() {
		0
	} else {
		now_millis().saturating_add(ttl.as_millis() as u64)
	}
}

/// Default TTL per namespace, applied when a write carries no explicit TTL.
#[derive(Debug, Clone, Default)]
pub struct TtlConfig {
	ttls: HashMap<StorageKey, Duration>,
}

impl TtlConfig {
	/// Reads `ttl_<namespace>` integer keys (seconds) from the backend config.
	fn from_config(config: &toml::Value) -> Self {
		let ttls = StorageKey::all()
			.filter_map(|storage_key| {
				config
					.get(format!("ttl_{}", storage_key.as_str()))
					.and_then(|v| v.as_integer())
					.map(|secs| (storage_key, Duration::from_secs(secs.max(0) as u64)))
			})
			.collect();
		Self { ttls }
	}

	fn ttl_for_key(&self, key: &str) -> Duration {
		key.split(':')
			.next()
			.and_then(|ns| ns.parse::<StorageKey>().ok())
			.and_then(|sk| self.ttls.get(&sk).copied())
			.unwrap_or(Duration::ZERO)
	}
}

/// Encodes a key into a filesystem-safe name.
fn encode_key(key: &str) -> String {
	let mut out = String::with_capacity(key.len());
	for byte in key.bytes() {
		if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || byte == b'.' {
			out.push(byte as char);
		} else {
			out.push_str(&format!("%{:02X}", byte));
		}
	}
	out
}

/// File stem for a key: the encoded key, or `<namespace>~<uuid>` when that
/// would be too long. `~` never appears in an encoded key.
fn file_stem(key: &str) -> String {
	let encoded = encode_key(key);
	if encoded.len() <= MAX_FILE_STEM {
		return encoded;
	}
	let namespace = key.split(':').next().unwrap_or_default();
	format!(
		"{}~{}",
		encode_key(namespace),
		Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).simple()
	)
}

/// A write as recorded in the commit journal, with its expiry resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JournalWrite {
	key: String,
	/// `None` deletes the key.
	value: Option<Vec<u8>>,
	expires_at_ms: u64,
}

/// File-based storage implementation.
pub struct FileStorage {
	base_path: PathBuf,
	ttl_config: TtlConfig,
	write_lock: Mutex<()>,
}

impl FileStorage {
	pub fn new(base_path: PathBuf, ttl_config: TtlConfig) -> Self {
		Self {
			base_path,
			ttl_config,
			write_lock: Mutex::new(()),
		}
	}

	fn file_path(&self, key: &str) -> PathBuf {
		self.base_path.join(format!("{}.bin", file_stem(key)))
	}

	/// Reads and decodes a file, or `None` if it does not exist.
	async fn read_record(&self, path: &Path) -> Result<Option<Record>, StorageError> {
		match fs::read(path).await {
			Ok(data) => Record::parse(data).map(Some),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(backend_err(e)),
		}
	}

	/// Live value stored under `key`, or `None` if missing or expired.
	async fn read_live(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		let Some(record) = self.read_record(&self.file_path(key)).await? else {
			return Ok(None);
		};
		if record.key != key {
			return Err(StorageError::Backend(format!(
				"File for key {} holds key {}",
				key, record.key
			)));
		}
		Ok(record.is_live().then_some(record.value))
	}

	fn resolve(&self, write: &WriteOp) -> JournalWrite {
		match write {
			WriteOp::Put { key, value, ttl } => JournalWrite {
				key: key.clone(),
				value: Some(value.clone()),
				expires_at_ms: expires_at(ttl.unwrap_or_else(|| self.ttl_config.ttl_for_key(key))),
			},
			WriteOp::Delete { key } => JournalWrite {
				key: key.clone(),
				value: None,
				expires_at_ms: 0,
			},
		}
	}

	/// Applies one write; the caller must hold `write_lock`.
	async fn apply_locked(&self, write: &JournalWrite) -> Result<(), StorageError> {
		let path = self.file_path(&write.key);
		let Some(value) = &write.value else {
			return match fs::remove_file(&path).await {
				Ok(_) => Ok(()),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
				Err(e) => Err(backend_err(e)),
			};
		};

		let key_len = u16::try_from(write.key.len())
			.map_err(|_| StorageError::Backend(format!("Key too long: {} bytes", write.key.len())))?;
		let header = FileHeader {
			expires_at_ms: write.expires_at_ms,
			key_len,
		};
		let mut file_data = Vec::with_capacity(FileHeader::SIZE + write.key.len() + value.len());
		file_data.extend_from_slice(&header.serialize());
		file_data.extend_from_slice(write.key.as_bytes());
		file_data.extend_from_slice(value);

		fs::create_dir_all(&self.base_path).await.map_err(backend_err)?;
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, file_data).await.map_err(backend_err)?;
		fs::rename(&temp_path, &path).await.map_err(backend_err)
	}

	/// Durably records `writes` as committed; the caller must hold `write_lock`.
	async fn write_journal_locked(&self, writes: &[JournalWrite]) -> Result<(), StorageError> {
		let data = serde_json::to_vec(writes)
			.map_err(|e| StorageError::Serialization(e.to_string()))?;

		fs::create_dir_all(&self.base_path).await.map_err(backend_err)?;
		let temp_path = self.base_path.join(JOURNAL_TEMP_FILE);
		let mut file = fs::File::create(&temp_path).await.map_err(backend_err)?;
		file.write_all(&data).await.map_err(backend_err)?;
		file.sync_all().await.map_err(backend_err)?;
		drop(file);
		fs::rename(&temp_path, self.base_path.join(JOURNAL_FILE))
			.await
			.map_err(backend_err)
	}

	/// Applies a committed journal and removes it; the caller must hold
	/// `write_lock`. Returns whether a journal was found.
	async fn replay_journal_locked(&self) -> Result<bool, StorageError> {
		match fs::remove_file(self.base_path.join(JOURNAL_TEMP_FILE)).await {
			Ok(_) => tracing::warn!("Discarded incomplete commit journal"),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
			Err(e) => return Err(backend_err(e)),
		}

		let journal_path = self.base_path.join(JOURNAL_FILE);
		let data = match fs::read(&journal_path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
			Err(e) => return Err(backend_err(e)),
		};
		let writes: Vec<JournalWrite> = serde_json::from_slice(&data)
			.map_err(|e| StorageError::Backend(format!("Corrupt commit journal: {}", e)))?;

		for write in &writes {
			self.apply_locked(write).await?;
		}
		fs::remove_file(&journal_path).await.map_err(backend_err)?;
		Ok(true)
	}

	/// Every decodable `.bin` file in the base directory.
	async fn records(&self) -> Result<Vec<(PathBuf, Record)>, StorageError> {
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(backend_err(e)),
		};

		let mut out = Vec::new();
		while let Some(entry) = entries.next_entry().await.map_err(backend_err)? {
			let path = entry.path();
			if path.extension() != Some(std::ffi::OsStr::new("bin")) {
				continue;
			}
			match self.read_record(&path).await {
				Ok(Some(record)) => out.push((path, record)),
				Ok(None) => {},
				Err(e) => tracing::debug!("Skipping file {:?}: {}", path, e),
			}
		}
		Ok(out)
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.read_live(key).await?.ok_or(StorageError::NotFound)
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let write = self.resolve(&WriteOp::Put {
			key: key.to_string(),
			value,
			ttl,
		});
		let _guard = self.write_lock.lock().await;
		self.apply_locked(&write).await
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let write = self.resolve(&WriteOp::Delete {
			key: key.to_string(),
		});
		let _guard = self.write_lock.lock().await;
		self.apply_locked(&write).await
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		Ok(self.read_live(key).await?.is_some())
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		Ok(self
			.records()
			.await?
			.into_iter()
			.filter(|(_, record)| record.key.starts_with(prefix) && record.is_live())
			.map(|(_, record)| record.key)
			.collect())
	}

	async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().await;

		for precondition in &batch.preconditions {
			let current = self.read_live(precondition.key()).await?;
			if !precondition.holds(current.as_deref()) {
				return Err(StorageError::Conflict(format!(
					"precondition failed for {}",
					precondition.key()
				)));
			}
		}

		let writes: Vec<JournalWrite> = batch.writes.iter().map(|w| self.resolve(w)).collect();
		if let [single] = writes.as_slice() {
			return self.apply_locked(single).await;
		}
		if writes.is_empty() {
			return Ok(());
		}

		self.write_journal_locked(&writes).await?;
		for write in &writes {
			self.apply_locked(write).await?;
		}
		fs::remove_file(self.base_path.join(JOURNAL_FILE))
			.await
			.map_err(backend_err)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let _guard = self.write_lock.lock().await;
		let mut removed = 0;
		for (path, record) in self.records().await? {
			if record.is_live() {
				continue;
			}
			match fs::remove_file(&path).await {
				Ok(_) => removed += 1,
				Err(e) => tracing::warn!("Failed to remove expired file {:?}: {}", path, e),
			}
		}
		Ok(removed)
	}

	async fn recover(&self) -> Result<usize, StorageError> {
		let _guard = self.write_lock.lock().await;
		let replayed = self.replay_journal_locked().await?;
		if replayed {
			tracing::warn!(component = "storage", "Replayed interrupted commit");
		}
		Ok(usize::from(replayed))
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let mut optional_fields = vec![Field::new("storage_path", FieldType::String)];
		for storage_key in StorageKey::all() {
			optional_fields.push(Field::new(
				format!("ttl_{}", storage_key.as_str()),
				FieldType::Integer {
					min: Some(0),
					max: None,
				},
			));
		}
		Schema::new(vec![], optional_fields).validate(config)
	}
}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: base directory (default: "./data/storage")
/// - `ttl_<namespace>`: default TTL in seconds for writes without one (default: 0, never)
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	Ok(Box::new(FileStorage::new(
		PathBuf::from(storage_path),
		TtlConfig::from_config(config),
	)))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
