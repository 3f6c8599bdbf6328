//! Document persistence collaborator.
//!
//! The core reads and writes conversation and message records through this
//! seam; the storage schema behind it is not part of the core's contract.
//! Two implementations ship here: an in-memory store and a JSON-file store
//! with atomic temp-file + rename writes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// External document-store collaborator: get/query/create/update by
/// collection name and id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;
    async fn query(&self, collection: &str) -> Result<Vec<Value>>;
    async fn create(&self, collection: &str, id: &str, doc: Value) -> Result<()>;
    async fn update(&self, collection: &str, id: &str, doc: Value) -> Result<()>;
}

/// In-memory document store. Used by tests and as the default when no
/// storage directory is configured.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query(&self, collection: &str) -> Result<Vec<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut collections = self.collections.write().await;
        let docs = collections
            .get_mut(collection)
            .with_context(|| format!("unknown collection {}", collection))?;
        if !docs.contains_key(id) {
            anyhow::bail!("document {}/{} does not exist", collection, id);
        }
        docs.insert(id.to_string(), doc);
        Ok(())
    }
}

/// JSON-file document store. One file per document under
/// `<dir>/<collection>/<id>.json`, written atomically and cached in memory.
pub struct JsonDocumentStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl JsonDocumentStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let store = Self {
            dir,
            cache: RwLock::new(HashMap::new()),
        };
        store.load_existing().await?;
        Ok(store)
    }

    fn doc_path(&self, collection: &str, id: &str) -> PathBuf {
        self.dir.join(collection).join(format!("{}.json", id))
    }

    /// Load all documents from disk into the cache.
    async fn load_existing(&self) -> Result<()> {
        let mut count = 0;
        let mut dirs = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let collection = entry.file_name().to_string_lossy().to_string();
            let mut files = fs::read_dir(entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match self.load_doc(&path).await {
                    Ok(doc) => {
                        self.cache
                            .write()
                            .await
                            .entry(collection.clone())
                            .or_default()
                            .insert(id.to_string(), doc);
                        count += 1;
                    }
                    Err(e) => {
                        warn!("[Store] Failed to load {:?}: {}", path, e);
                    }
                }
            }
        }
        info!("[Store] Loaded {} existing documents", count);
        Ok(())
    }

    async fn load_doc(&self, path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {:?}", path))
    }

    /// Write a document to disk atomically.
    async fn save_doc(&self, collection: &str, id: &str, doc: &Value) -> Result<()> {
        let path = self.doc_path(collection, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(doc)?;
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let cache = self.cache.read().await;
        Ok(cache
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query(&self, collection: &str) -> Result<Vec<Value>> {
        let cache = self.cache.read().await;
        Ok(cache
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        self.save_doc(collection, id, &doc).await?;
        self.cache
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        {
            let cache = self.cache.read().await;
            let exists = cache
                .get(collection)
                .map(|docs| docs.contains_key(id))
                .unwrap_or(false);
            if !exists {
                anyhow::bail!("document {}/{} does not exist", collection, id);
            }
        }
        self.save_doc(collection, id, &doc).await?;
        self.cache
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }
}
