use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

const METADATA_SUFFIX: &str = ".meta.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("metadata encoding failed: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Custom metadata recorded with every cached object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// After this instant an external sweep may delete the object.
    pub expires_at: DateTime<Utc>,
    pub original_url: String,
    pub extension: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOptions {
    pub content_type: String,
    pub cache_control_max_age_seconds: u64,
    pub metadata: CacheMetadata,
}

impl PutOptions {
    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_control_max_age_seconds)
    }
}

/// Durable key/value store for mirrored media. Objects are written once.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Existence probe; never reads object bytes.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn put(&self, key: &str, bytes: Bytes, options: PutOptions) -> Result<(), StoreError>;
}

/// Reject keys that could escape a store root or collide with sidecars.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad_segment = key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if key.is_empty() || bad_segment || key.contains('\\') || key.ends_with(METADATA_SUFFIX) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    cache_control: String,
    metadata: CacheMetadata,
}

/// Filesystem-backed store: `{root}/{key}` plus a `{root}/{key}.meta.json` sidecar.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    pub fn metadata_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}{METADATA_SUFFIX}")))
    }

    fn write_object(&self, key: &str, bytes: &[u8], options: &PutOptions) -> Result<(), StoreError> {
        let target = self.object_path(key)?;
        let sidecar = Sidecar {
            content_type: options.content_type.clone(),
            cache_control: options.cache_control(),
            metadata: options.metadata.clone(),
        };
        let sidecar_bytes = serde_json::to_vec_pretty(&sidecar)?;

        // Sidecar first: an object file only appears once its metadata exists.
        write_atomically(&self.metadata_path(key)?, &sidecar_bytes)?;
        write_atomically(&target, bytes)?;
        Ok(())
    }
}

/// Write via a temp file in the target directory, then rename into place.
fn write_atomically(target: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = target
        .parent()
        .ok_or_else(|| StoreError::InvalidKey(target.display().to_string()))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(target).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.object_path(key)?;
        tokio::task::spawn_blocking(move || path.try_exists())
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
            .map_err(StoreError::from)
    }

    async fn put(&self, key: &str, bytes: Bytes, options: PutOptions) -> Result<(), StoreError> {
        let store = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.write_object(&key, &bytes, &options))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub options: PutOptions,
}

/// In-process store; contents vanish with the value.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let objects = self.objects.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(objects.contains_key(key))
    }

    async fn put(&self, key: &str, bytes: Bytes, options: PutOptions) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut objects = self.objects.lock().map_err(|_| StoreError::Poisoned)?;
        objects
            .entry(key.to_string())
            .or_insert(StoredObject { bytes, options });
        Ok(())
    }
}
