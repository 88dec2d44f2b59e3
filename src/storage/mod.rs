//! Durable key-value persistence.
//!
//! Records are JSON values keyed by (collection, organization, id) with
//! last-write-wins semantics per key; no transactions. The engine only
//! depends on the [`KvStore`] trait, so tests run against [`MemoryStore`]
//! and production against [`FileStore`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "storage I/O error: {e}"),
            Self::Serde(e) => write!(f, "storage encoding error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, collection: &str, org: &str, id: &str)
        -> Result<Option<Value>, StoreError>;
    async fn put(
        &self,
        collection: &str,
        org: &str,
        id: &str,
        value: Value,
    ) -> Result<(), StoreError>;
    async fn delete(&self, collection: &str, org: &str, id: &str) -> Result<(), StoreError>;
}

/// JSON files under `<root>/<collection>/<org>/<id>.json`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, collection: &str, org: &str, id: &str) -> PathBuf {
        self.root
            .join(collection)
            .join(org)
            .join(format!("{id}.json"))
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(
        &self,
        collection: &str,
        org: &str,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let path = self.record_path(collection, org, id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        collection: &str,
        org: &str,
        id: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let path = self.record_path(collection, org, id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, org: &str, id: &str) -> Result<(), StoreError> {
        let path = self.record_path(collection, org, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(collection: &str, org: &str, id: &str) -> String {
        format!("{collection}/{org}/{id}")
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(
        &self,
        collection: &str,
        org: &str,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&Self::key(collection, org, id))
            .cloned())
    }

    async fn put(
        &self,
        collection: &str,
        org: &str,
        id: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(Self::key(collection, org, id), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, org: &str, id: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .remove(&Self::key(collection, org, id));
        Ok(())
    }
}
