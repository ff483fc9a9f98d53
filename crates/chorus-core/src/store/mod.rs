//! The document store capability.
//!
//! A [`Collections`] backend stores named collections of JSON documents and
//! understands the Mongo-style filter/update dialect implemented in
//! [`query`]. Two backends ship with the core:
//!
//! - [`MemoryStore`]: process-local, used for tests and ephemeral hosts.
//! - [`FileStore`]: a `MemoryStore` persisted as one JSON file per collection.
//!
//! [`open_store`] picks one from a `STORE_URI` (`memory://` or `file://<dir>`).

pub mod file;
pub mod memory;
pub mod query;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

pub use file::FileStore;
pub use memory::MemoryStore;

// =============================================================================
// Options and outcomes
// =============================================================================

/// Options for [`Collections::find`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort specification (`{ "field": 1 | -1, ... }`).
    pub sort: Option<Value>,
    /// Documents to skip after sorting.
    pub skip: usize,
    /// Maximum documents to return.
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Sort by the given specification.
    pub fn sort(mut self, spec: Value) -> Self {
        self.sort = Some(spec);
        self
    }

    /// Skip the first `n` documents.
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Return at most `n` documents.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// Options for [`Collections::update_one`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert a document built from the filter when nothing matches.
    pub upsert: bool,
}

impl UpdateOptions {
    /// Upserting update.
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

/// Result of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Documents matched by the filter.
    pub matched: u64,
    /// Documents actually changed.
    pub modified: u64,
    /// `_id` of the inserted document on upsert.
    pub upserted_id: Option<String>,
}

/// Index declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed fields with direction (`1` ascending, `-1` descending).
    pub keys: Vec<(String, i32)>,
    /// Reject documents whose key tuple already exists.
    #[serde(default)]
    pub unique: bool,
    /// Explicit index name; derived from the keys when absent.
    #[serde(default)]
    pub name: Option<String>,
}

impl IndexSpec {
    /// Creates an index over the given fields.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(|(k, d)| (k.into(), d)).collect(),
            unique: false,
            name: None,
        }
    }

    /// Marks the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Returns the explicit or derived index name (`userId_1_at_-1`).
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.keys
                .iter()
                .map(|(k, d)| format!("{k}_{d}"))
                .collect::<Vec<_>>()
                .join("_")
        })
    }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a document.
    Insert {
        /// Target collection.
        collection: String,
        /// Document to insert.
        document: Value,
    },
    /// Update the first matching document.
    Update {
        /// Target collection.
        collection: String,
        /// Match filter.
        filter: Value,
        /// Update document.
        update: Value,
        /// Insert when nothing matches.
        upsert: bool,
        /// Abort the whole batch with [`StoreError::Conflict`] when nothing matches.
        require_match: bool,
    },
}

// =============================================================================
// Collections
// =============================================================================

/// A schemaless document store with named collections.
///
/// Collections are created lazily on first write. Filters, updates and
/// pipelines follow the dialect described in [`query`].
#[async_trait]
pub trait Collections: Send + Sync + 'static {
    /// Identifies the backing store (used to key circuit breakers).
    fn endpoint(&self) -> &str;

    /// Cheap liveness check.
    async fn ping(&self) -> StoreResult<()>;

    /// Returns matching documents.
    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: FindOptions,
    ) -> StoreResult<Vec<Value>>;

    /// Returns the first matching document.
    async fn find_one(&self, collection: &str, filter: &Value) -> StoreResult<Option<Value>>;

    /// Inserts a document and returns its `_id`.
    async fn insert_one(&self, collection: &str, document: Value) -> StoreResult<String>;

    /// Updates the first matching document.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: UpdateOptions,
    ) -> StoreResult<UpdateOutcome>;

    /// Deletes the first matching document; returns the number deleted.
    async fn delete_one(&self, collection: &str, filter: &Value) -> StoreResult<u64>;

    /// Deletes every matching document; returns the number deleted.
    async fn delete_many(&self, collection: &str, filter: &Value) -> StoreResult<u64>;

    /// Runs an aggregation pipeline.
    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> StoreResult<Vec<Value>>;

    /// Creates an index; a no-op when an identical index exists.
    async fn create_index(&self, collection: &str, index: IndexSpec) -> StoreResult<String>;

    /// Whether [`apply_atomic`](Self::apply_atomic) is available.
    fn supports_transactions(&self) -> bool;

    /// Applies every write or none of them.
    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Persists buffered writes.
    async fn flush(&self) -> StoreResult<()>;
}

/// Type alias for a shared store.
pub type BoxedCollections = Arc<dyn Collections>;

// =============================================================================
// Collection handle
// =============================================================================

/// A store bound to one collection name.
#[derive(Clone)]
pub struct Collection {
    store: BoxedCollections,
    name: Arc<str>,
}

impl Collection {
    /// Binds `store` to `name`.
    pub fn new(store: BoxedCollections, name: &str) -> Self {
        Self {
            store,
            name: Arc::from(name),
        }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// See [`Collections::find`].
    pub async fn find(&self, filter: &Value, options: FindOptions) -> StoreResult<Vec<Value>> {
        self.store.find(&self.name, filter, options).await
    }

    /// See [`Collections::find_one`].
    pub async fn find_one(&self, filter: &Value) -> StoreResult<Option<Value>> {
        self.store.find_one(&self.name, filter).await
    }

    /// See [`Collections::insert_one`].
    pub async fn insert_one(&self, document: Value) -> StoreResult<String> {
        self.store.insert_one(&self.name, document).await
    }

    /// See [`Collections::update_one`].
    pub async fn update_one(
        &self,
        filter: &Value,
        update: &Value,
        options: UpdateOptions,
    ) -> StoreResult<UpdateOutcome> {
        self.store
            .update_one(&self.name, filter, update, options)
            .await
    }

    /// See [`Collections::delete_one`].
    pub async fn delete_one(&self, filter: &Value) -> StoreResult<u64> {
        self.store.delete_one(&self.name, filter).await
    }

    /// See [`Collections::delete_many`].
    pub async fn delete_many(&self, filter: &Value) -> StoreResult<u64> {
        self.store.delete_many(&self.name, filter).await
    }

    /// See [`Collections::aggregate`].
    pub async fn aggregate(&self, pipeline: &[Value]) -> StoreResult<Vec<Value>> {
        self.store.aggregate(&self.name, pipeline).await
    }

    /// See [`Collections::create_index`].
    pub async fn create_index(&self, index: IndexSpec) -> StoreResult<String> {
        self.store.create_index(&self.name, index).await
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("endpoint", &self.store.endpoint())
            .field("name", &self.name)
            .finish()
    }
}

// =============================================================================
// Store selection
// =============================================================================

/// Opens the store named by a URI.
///
/// - `memory://` (or `memory://<label>`): a fresh [`MemoryStore`].
/// - `file://<dir>`: a [`FileStore`] rooted at `<dir>`; created when missing.
pub async fn open_store(uri: &str) -> StoreResult<BoxedCollections> {
    if let Some(label) = uri.strip_prefix("memory://") {
        let label = if label.is_empty() { "default" } else { label };
        return Ok(Arc::new(MemoryStore::with_endpoint(format!(
            "memory://{label}"
        ))));
    }
    if let Some(dir) = uri.strip_prefix("file://") {
        if dir.is_empty() {
            return Err(StoreError::Unavailable("file:// URI without a path".into()));
        }
        return Ok(Arc::new(FileStore::open(dir).await?));
    }
    Err(StoreError::Unavailable(format!(
        "unsupported store URI '{uri}' (expected memory:// or file://)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_name_is_derived() {
        let index = IndexSpec::new([("userId", 1), ("at", -1)]);
        assert_eq!(index.name(), "userId_1_at_-1");
        assert!(!index.unique);
    }

    #[tokio::test]
    async fn test_open_store_by_uri() {
        let store = open_store("memory://").await.unwrap();
        assert_eq!(store.endpoint(), "memory://default");

        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().display());
        let store = open_store(&uri).await.unwrap();
        assert_eq!(store.endpoint(), uri);

        assert!(open_store("mongodb://localhost").await.is_err());
    }
}
