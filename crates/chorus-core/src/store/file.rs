//! A [`MemoryStore`] persisted as one JSON file per collection.
//!
//! The whole data set is loaded at open. Writes go to memory and mark the
//! store dirty; [`Collections::flush`] rewrites every collection file
//! atomically (write to a temporary file, then rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::memory::{CollectionData, MemoryStore, StoreState};
use super::{Collections, FindOptions, IndexSpec, UpdateOptions, UpdateOutcome, WriteOp};
use crate::error::{StoreError, StoreResult};

const EXTENSION: &str = "json";

/// A file-backed [`Collections`] backend.
pub struct FileStore {
    dir: PathBuf,
    inner: MemoryStore,
    dirty: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Opens (or creates) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut collections = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = tokio::fs::read(&path).await?;
            let data: CollectionData = serde_json::from_slice(&bytes)?;
            debug!(collection = name, documents = data.documents.len(), "Loaded collection");
            collections.insert(name.to_string(), data);
        }

        info!(dir = %dir.display(), collections = collections.len(), "File store opened");

        let endpoint = format!("file://{}", dir.display());
        Ok(Self {
            inner: MemoryStore::from_state(endpoint, StoreState { collections }),
            dir,
            dirty: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Directory holding the collection files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns `true` when writes are waiting for [`Collections::flush`].
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn check_name(collection: &str) -> StoreResult<()> {
        let valid = !collection.is_empty()
            && collection
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'));
        if valid {
            Ok(())
        } else {
            Err(StoreError::invalid_query(format!(
                "collection name '{collection}' is not usable as a file name"
            )))
        }
    }

    fn touched<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if result.is_ok() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }
}

#[async_trait]
impl Collections for FileStore {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn ping(&self) -> StoreResult<()> {
        tokio::fs::metadata(&self.dir).await?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: FindOptions,
    ) -> StoreResult<Vec<Value>> {
        self.inner.find(collection, filter, options).await
    }

    async fn find_one(&self, collection: &str, filter: &Value) -> StoreResult<Option<Value>> {
        self.inner.find_one(collection, filter).await
    }

    async fn insert_one(&self, collection: &str, document: Value) -> StoreResult<String> {
        Self::check_name(collection)?;
        let result = self.inner.insert_one(collection, document).await;
        self.touched(result)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: UpdateOptions,
    ) -> StoreResult<UpdateOutcome> {
        Self::check_name(collection)?;
        let result = self
            .inner
            .update_one(collection, filter, update, options)
            .await;
        self.touched(result)
    }

    async fn delete_one(&self, collection: &str, filter: &Value) -> StoreResult<u64> {
        let result = self.inner.delete_one(collection, filter).await;
        self.touched(result)
    }

    async fn delete_many(&self, collection: &str, filter: &Value) -> StoreResult<u64> {
        let result = self.inner.delete_many(collection, filter).await;
        self.touched(result)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> StoreResult<Vec<Value>> {
        self.inner.aggregate(collection, pipeline).await
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> StoreResult<String> {
        Self::check_name(collection)?;
        let result = self.inner.create_index(collection, index).await;
        self.touched(result)
    }

    fn supports_transactions(&self) -> bool {
        self.inner.supports_transactions()
    }

    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        for op in &ops {
            match op {
                WriteOp::Insert { collection, .. } | WriteOp::Update { collection, .. } => {
                    Self::check_name(collection)?;
                }
            }
        }
        let result = self.inner.apply_atomic(ops).await;
        self.touched(result)
    }

    async fn flush(&self) -> StoreResult<()> {
        let _guard = self.flush_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = self.inner.snapshot();
        let result = async {
            for (name, data) in &snapshot {
                let path = self.dir.join(format!("{name}.{EXTENSION}"));
                let tmp = self.dir.join(format!(".{name}.{EXTENSION}.tmp"));
                let bytes = serde_json::to_vec_pretty(data)?;
                tokio::fs::write(&tmp, bytes).await?;
                tokio::fs::rename(&tmp, &path).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;

        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        } else {
            debug!(collections = snapshot.len(), "File store flushed");
        }
        result
    }
}
