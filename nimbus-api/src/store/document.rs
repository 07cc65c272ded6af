//! Document-store collaborator interface.
//!
//! The durable layer is a document store with one collection per entity
//! kind. Driver internals are out of scope here; the orchestrator only
//! depends on this trait. The sync component consults
//! `is_backed_by_document_store` instead of probing the implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::error::{Result, StoreError};

/// Collection names, one per entity kind.
pub mod collections {
    pub const NODES: &str = "nodes";
    pub const VMS: &str = "vms";
    pub const USERS: &str = "users";
    pub const COMMANDS: &str = "commands";
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// True when writes actually reach durable storage. The sync loop
    /// skips flushing otherwise.
    fn is_backed_by_document_store(&self) -> bool;

    async fn upsert(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn load_collection(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>>;
}

/// Discards everything. Used in dev mode and tests that don't exercise
/// persistence.
pub struct NoopDocumentStore;

#[async_trait]
impl DocumentStore for NoopDocumentStore {
    fn is_backed_by_document_store(&self) -> bool {
        false
    }

    async fn upsert(&self, _collection: &str, _id: &str, _doc: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _collection: &str, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn load_collection(&self, _collection: &str) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(Vec::new())
    }
}

/// In-memory document store for tests that exercise the sync path.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn is_backed_by_document_store(&self) -> bool {
        true
    }

    async fn upsert(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<()> {
        self.collections
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        if let Some(c) = self.collections.lock().await.get_mut(collection) {
            c.remove(id);
        }
        Ok(())
    }

    async fn load_collection(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(self
            .collections
            .lock()
            .await
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// File-per-document store under a data directory. The bundled driver for
/// single-host deployments.
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn doc_path(&self, collection: &str, id: &str) -> PathBuf {
        self.root.join(collection).join(format!("{}.json", id))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    fn is_backed_by_document_store(&self) -> bool {
        true
    }

    async fn upsert(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<()> {
        let dir = self.root.join(collection);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Internal(format!("create {}: {}", dir.display(), e)))?;
        let path = self.doc_path(collection, id);
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| StoreError::Internal(format!("serialize {}: {}", id, e)))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StoreError::Internal(format!("write {}: {}", path.display(), e)))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let path = self.doc_path(collection, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Internal(format!(
                "remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn load_collection(&self, collection: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let dir = self.root.join(collection);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(StoreError::Internal(format!(
                    "read {}: {}",
                    dir.display(),
                    e
                )));
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|e| StoreError::Internal(format!("read {}: {}", path.display(), e)))?;
            match serde_json::from_slice(&raw) {
                Ok(doc) => out.push((id, doc)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable document");
                }
            }
        }
        Ok(out)
    }
}
