//! Process-local document store.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::query;
use super::{Collections, FindOptions, IndexSpec, UpdateOptions, UpdateOutcome, WriteOp};
use crate::error::{StoreError, StoreResult};

/// One collection: documents in insertion order plus its indexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CollectionData {
    #[serde(default)]
    pub(crate) indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub(crate) documents: Vec<Value>,
}

impl CollectionData {
    /// Finds the position of the first document matching `filter`.
    fn position(&self, filter: &Value) -> StoreResult<Option<usize>> {
        for (i, doc) in self.documents.iter().enumerate() {
            if query::matches(doc, filter)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Rejects `doc` if it collides with another document on a unique index.
    fn check_unique(&self, name: &str, doc: &Value, skip: Option<usize>) -> StoreResult<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key: Vec<Option<&Value>> = index
                .keys
                .iter()
                .map(|(field, _)| query::get_path(doc, field))
                .collect();
            let clash = self.documents.iter().enumerate().any(|(i, other)| {
                Some(i) != skip
                    && index
                        .keys
                        .iter()
                        .map(|(field, _)| query::get_path(other, field))
                        .eq(key.iter().copied())
            });
            if clash {
                return Err(StoreError::DuplicateKey {
                    collection: name.to_string(),
                    index: index.name(),
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, mut doc: Value) -> StoreResult<String> {
        let Value::Object(map) = &mut doc else {
            return Err(StoreError::invalid_query("document must be an object"));
        };
        let id = match map.get("_id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                map.insert("_id".into(), Value::String(id.clone()));
                id
            }
        };
        self.check_unique(name, &doc, None)?;
        self.documents.push(doc);
        Ok(id)
    }

    fn update(
        &mut self,
        name: &str,
        filter: &Value,
        update: &Value,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome> {
        if let Some(pos) = self.position(filter)? {
            let mut doc = self.documents[pos].clone();
            let changed = query::apply_update(&mut doc, update, false)?;
            if changed {
                self.check_unique(name, &doc, Some(pos))?;
                self.documents[pos] = doc;
            }
            return Ok(UpdateOutcome {
                matched: 1,
                modified: u64::from(changed),
                upserted_id: None,
            });
        }

        if !upsert {
            return Ok(UpdateOutcome::default());
        }

        let mut doc = query::upsert_seed(filter);
        query::apply_update(&mut doc, update, true)?;
        let id = self.insert(name, doc)?;
        Ok(UpdateOutcome {
            matched: 0,
            modified: 0,
            upserted_id: Some(id),
        })
    }
}

/// The mutable heart of a [`MemoryStore`].
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) collections: HashMap<String, CollectionData>,
}

/// An in-memory [`Collections`] backend.
///
/// Besides serving as a real backend, it supports fault injection
/// ([`fail_next`](Self::fail_next), [`set_latency`](Self::set_latency)) so
/// that retry and timeout behaviour can be exercised deterministically.
pub struct MemoryStore {
    endpoint: String,
    state: Mutex<StoreState>,
    transactions: bool,
    faults: Mutex<VecDeque<StoreError>>,
    latency: Mutex<Option<Duration>>,
    lost_replies: Mutex<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store at `memory://default`.
    pub fn new() -> Self {
        Self::with_endpoint("memory://default")
    }

    /// Creates an empty store with a custom endpoint label.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self::from_state(endpoint.into(), StoreState::default())
    }

    pub(crate) fn from_state(endpoint: String, state: StoreState) -> Self {
        Self {
            endpoint,
            state: Mutex::new(state),
            transactions: true,
            faults: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            lost_replies: Mutex::new(0),
        }
    }

    /// Disables [`Collections::apply_atomic`], as on a store without
    /// multi-document transactions.
    pub fn without_transactions(mut self) -> Self {
        self.transactions = false;
        self
    }

    /// Makes the next calls fail with the given errors, one per call.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.faults.lock().extend(errors);
    }

    /// Applies the next `n` writes but reports each as a transient failure,
    /// as when the connection drops before the reply arrives.
    pub fn lose_next_replies(&self, n: usize) {
        *self.lost_replies.lock() += n;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, |c| c.documents.len())
    }

    /// Copies out every collection.
    pub(crate) fn snapshot(&self) -> HashMap<String, CollectionData> {
        self.state.lock().collections.clone()
    }

    async fn enter(&self, op: &'static str) -> StoreResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.faults.lock().pop_front() {
            trace!(op, error = %err, "Injected store fault");
            return Err(err);
        }
        Ok(())
    }

    fn reply<T>(&self, op: &'static str, outcome: T) -> StoreResult<T> {
        let mut lost = self.lost_replies.lock();
        if *lost > 0 {
            *lost -= 1;
            trace!(op, "Injected lost reply");
            return Err(StoreError::Transient("reply lost".into()));
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Collections for MemoryStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> StoreResult<()> {
        self.enter("ping").await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: FindOptions,
    ) -> StoreResult<Vec<Value>> {
        self.enter("find").await?;
        let mut docs = {
            let state = self.state.lock();
            let Some(data) = state.collections.get(collection) else {
                return Ok(Vec::new());
            };
            let mut out = Vec::new();
            for doc in &data.documents {
                if query::matches(doc, filter)? {
                    out.push(doc.clone());
                }
            }
            out
        };
        if let Some(sort) = &options.sort {
            query::sort_documents(&mut docs, sort)?;
        }
        let docs = docs.into_iter().skip(options.skip);
        Ok(match options.limit {
            Some(n) => docs.take(n).collect(),
            None => docs.collect(),
        })
    }

    async fn find_one(&self, collection: &str, filter: &Value) -> StoreResult<Option<Value>> {
        self.enter("find_one").await?;
        let state = self.state.lock();
        let Some(data) = state.collections.get(collection) else {
            return Ok(None);
        };
        Ok(data.position(filter)?.map(|i| data.documents[i].clone()))
    }

    async fn insert_one(&self, collection: &str, document: Value) -> StoreResult<String> {
        self.enter("insert_one").await?;
        let mut state = self.state.lock();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(collection, document)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: UpdateOptions,
    ) -> StoreResult<UpdateOutcome> {
        self.enter("update_one").await?;
        let outcome = self
            .state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .update(collection, filter, update, options.upsert)?;
        self.reply("update_one", outcome)
    }

    async fn delete_one(&self, collection: &str, filter: &Value) -> StoreResult<u64> {
        self.enter("delete_one").await?;
        let mut state = self.state.lock();
        let Some(data) = state.collections.get_mut(collection) else {
            return Ok(0);
        };
        match data.position(filter)? {
            Some(i) => {
                data.documents.remove(i);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_many(&self, collection: &str, filter: &Value) -> StoreResult<u64> {
        self.enter("delete_many").await?;
        let mut state = self.state.lock();
        let Some(data) = state.collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut kept = Vec::with_capacity(data.documents.len());
        let mut removed = 0;
        for doc in data.documents.drain(..) {
            if query::matches(&doc, filter)? {
                removed += 1;
            } else {
                kept.push(doc);
            }
        }
        data.documents = kept;
        Ok(removed)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> StoreResult<Vec<Value>> {
        self.enter("aggregate").await?;
        let docs = self
            .state
            .lock()
            .collections
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default();
        query::aggregate(docs, pipeline)
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> StoreResult<String> {
        self.enter("create_index").await?;
        let name = index.name();
        let mut state = self.state.lock();
        let data = state.collections.entry(collection.to_string()).or_default();
        if data.indexes.iter().any(|i| i.name() == name) {
            return Ok(name);
        }
        data.indexes.push(index);
        // Existing documents must already satisfy a new unique index.
        let docs = data.documents.clone();
        for (i, doc) in docs.iter().enumerate() {
            if let Err(e) = data.check_unique(collection, doc, Some(i)) {
                data.indexes.pop();
                return Err(e);
            }
        }
        Ok(name)
    }

    fn supports_transactions(&self) -> bool {
        self.transactions
    }

    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        if !self.transactions {
            return Err(StoreError::Unsupported("multi-document transactions"));
        }
        self.enter("apply_atomic").await?;

        let mut state = self.state.lock();
        let mut staged: HashMap<String, CollectionData> = HashMap::new();

        for op in ops {
            let name = match &op {
                WriteOp::Insert { collection, .. } | WriteOp::Update { collection, .. } => {
                    collection.clone()
                }
            };
            let data = staged.entry(name.clone()).or_insert_with(|| {
                state.collections.get(&name).cloned().unwrap_or_default()
            });
            match op {
                WriteOp::Insert { document, .. } => {
                    data.insert(&name, document)?;
                }
                WriteOp::Update {
                    filter,
                    update,
                    upsert,
                    require_match,
                    ..
                } => {
                    let outcome = data.update(&name, &filter, &update, upsert)?;
                    if require_match && outcome.matched == 0 {
                        return Err(StoreError::Conflict(name));
                    }
                }
            }
        }

        state.collections.extend(staged);
        drop(state);
        self.reply("apply_atomic", ())
    }

    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}
