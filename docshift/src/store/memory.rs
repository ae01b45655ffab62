//! In-process store used by tests, dry runs and `--store memory`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nanoid::nanoid;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{ID_FIELD, LockHolder, StoreAdapter, UpdateOptions};
use crate::changeset::{Document, IndexKey, IndexOptions};
use crate::document::{apply_mutation, get_path, matches, upsert_seed};
use crate::errors::{StoreError, StoreOperation, StoreResult};

#[derive(Debug, Clone, PartialEq)]
struct IndexDef {
    collection: String,
    keys: Vec<IndexKey>,
    unique: bool,
}

#[derive(Debug, Clone, Default)]
struct Collections {
    documents: BTreeMap<String, Vec<Document>>,
    indexes: BTreeMap<String, IndexDef>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Collections,
    snapshot: Option<Collections>,
    writer: Option<OwnedSemaphorePermit>,
    locks: HashMap<String, LockHolder>,
}

/// Mutex-guarded collections of JSON documents.
///
/// Transactions snapshot the collections on `begin` and restore them on
/// `abort`. Locks live outside the snapshot.
///
/// One transaction is open at a time: `begin` waits until the current one
/// commits or aborts. Writes made outside a transaction while another is open
/// are undone if that transaction aborts; the runner only writes inside
/// transactions.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    transactional: bool,
    writers: Arc<Semaphore>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            transactional: true,
            writers: Arc::new(Semaphore::new(1)),
        }
    }

    /// A store whose begin/commit/abort are no-ops, like most document stores.
    pub fn without_transactions() -> Self {
        Self {
            transactional: false,
            ..Self::new()
        }
    }

    fn state(&self, operation: StoreOperation) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::new(operation, "memory store mutex poisoned"))
    }
}

fn index_tuple(doc: &Document, keys: &[IndexKey]) -> Vec<Value> {
    keys.iter()
        .map(|key| get_path(doc, &key.field).cloned().unwrap_or(Value::Null))
        .collect()
}

/// First unique index violated by `candidate`, ignoring the document at `skip`.
fn unique_violation(
    data: &Collections,
    collection: &str,
    candidate: &Document,
    skip: Option<usize>,
    pending: &[Document],
) -> Option<String> {
    let existing = data.documents.get(collection).map(Vec::as_slice).unwrap_or_default();
    for (name, index) in &data.indexes {
        if index.collection != collection || !index.unique {
            continue;
        }
        let wanted = index_tuple(candidate, &index.keys);
        let clash = existing
            .iter()
            .enumerate()
            .filter(|(position, _)| Some(*position) != skip)
            .map(|(_, doc)| doc)
            .chain(pending)
            .any(|doc| index_tuple(doc, &index.keys) == wanted);
        if clash {
            return Some(name.clone());
        }
    }
    None
}

fn document_id(doc: &Document) -> Option<&Value> {
    doc.get(ID_FIELD)
}

fn with_id(doc: &Document) -> Document {
    let mut doc = doc.clone();
    if !doc.contains_key(ID_FIELD) {
        doc.insert(ID_FIELD.to_string(), Value::String(nanoid!()));
    }
    doc
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, collection: &str, documents: &[Document]) -> StoreResult<u64> {
        let op = StoreOperation::Insert;
        let mut state = self.state(op)?;
        let mut batch: Vec<Document> = Vec::with_capacity(documents.len());

        for doc in documents {
            let doc = with_id(doc);
            let id = document_id(&doc);
            let existing = state.data.documents.get(collection).map(Vec::as_slice).unwrap_or_default();
            if existing.iter().chain(&batch).any(|other| document_id(other) == id) {
                return Err(StoreError::new(
                    op,
                    format!("duplicate {ID_FIELD} {} in {collection}", id.cloned().unwrap_or_default()),
                ));
            }
            if let Some(index) = unique_violation(&state.data, collection, &doc, None, &batch) {
                return Err(StoreError::new(op, format!("unique index {index} violated in {collection}")));
            }
            batch.push(doc);
        }

        let inserted = batch.len() as u64;
        state
            .data
            .documents
            .entry(collection.to_string())
            .or_default()
            .extend(batch);
        Ok(inserted)
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Document,
        mutation: &Document,
        options: UpdateOptions,
    ) -> StoreResult<u64> {
        let op = StoreOperation::Update;
        let mut state = self.state(op)?;

        let mut targets = Vec::new();
        if let Some(docs) = state.data.documents.get(collection) {
            for (position, doc) in docs.iter().enumerate() {
                if matches(doc, filter).map_err(|err| StoreError::new(op, err))? {
                    targets.push(position);
                    if !options.multi {
                        break;
                    }
                }
            }
        }

        if targets.is_empty() {
            if !options.upsert {
                return Ok(0);
            }
            let seed = with_id(&upsert_seed(filter, mutation).map_err(|err| StoreError::new(op, err))?);
            let id = document_id(&seed);
            let existing = state.data.documents.get(collection).map(Vec::as_slice).unwrap_or_default();
            if existing.iter().any(|other| document_id(other) == id) {
                return Err(StoreError::new(
                    op,
                    format!("duplicate {ID_FIELD} {} in {collection}", id.cloned().unwrap_or_default()),
                ));
            }
            if let Some(index) = unique_violation(&state.data, collection, &seed, None, &[]) {
                return Err(StoreError::new(op, format!("unique index {index} violated in {collection}")));
            }
            state
                .data
                .documents
                .entry(collection.to_string())
                .or_default()
                .push(seed);
            return Ok(1);
        }

        let mut modified = 0;
        for position in targets {
            let mut updated = state.data.documents[collection][position].clone();
            let changed = apply_mutation(&mut updated, mutation).map_err(|err| StoreError::new(op, err))?;
            if !changed {
                continue;
            }
            if let Some(index) = unique_violation(&state.data, collection, &updated, Some(position), &[]) {
                return Err(StoreError::new(op, format!("unique index {index} violated in {collection}")));
            }
            if let Some(docs) = state.data.documents.get_mut(collection) {
                docs[position] = updated;
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn delete(&self, collection: &str, filter: &Document, multi: bool) -> StoreResult<u64> {
        let op = StoreOperation::Delete;
        let mut state = self.state(op)?;
        let Some(docs) = state.data.documents.get_mut(collection) else {
            return Ok(0);
        };

        let mut doomed = Vec::new();
        for (position, doc) in docs.iter().enumerate() {
            if matches(doc, filter).map_err(|err| StoreError::new(op, err))? {
                doomed.push(position);
                if !multi {
                    break;
                }
            }
        }

        for position in doomed.iter().rev() {
            docs.remove(*position);
        }
        Ok(doomed.len() as u64)
    }

    async fn create_index(&self, collection: &str, keys: &[IndexKey], options: &IndexOptions) -> StoreResult<()> {
        let op = StoreOperation::CreateIndex;
        let mut state = self.state(op)?;
        let name = options.resolved_name(collection, keys);
        let definition = IndexDef {
            collection: collection.to_string(),
            keys: keys.to_vec(),
            unique: options.unique,
        };

        if let Some(existing) = state.data.indexes.get(&name) {
            if *existing == definition {
                return Ok(());
            }
            return Err(StoreError::new(op, format!("index {name} exists with a different definition")));
        }

        if definition.unique {
            let docs = state.data.documents.get(collection).map(Vec::as_slice).unwrap_or_default();
            let mut seen = Vec::with_capacity(docs.len());
            for doc in docs {
                let tuple = index_tuple(doc, keys);
                if seen.contains(&tuple) {
                    return Err(StoreError::new(
                        op,
                        format!("cannot build unique index {name}: duplicate values in {collection}"),
                    ));
                }
                seen.push(tuple);
            }
        }

        state.data.indexes.insert(name, definition);
        Ok(())
    }

    async fn find(&self, collection: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        let op = StoreOperation::Find;
        let state = self.state(op)?;
        let mut found = Vec::new();
        for doc in state.data.documents.get(collection).into_iter().flatten() {
            if matches(doc, filter).map_err(|err| StoreError::new(op, err))? {
                found.push(doc.clone());
            }
        }
        Ok(found)
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn begin(&self) -> StoreResult<()> {
        if !self.transactional {
            return Ok(());
        }
        let op = StoreOperation::Transaction;
        let permit = self
            .writers
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| StoreError::new(op, err))?;
        let mut state = self.state(op)?;
        state.snapshot = Some(state.data.clone());
        state.writer = Some(permit);
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        if !self.transactional {
            return Ok(());
        }
        let mut state = self.state(StoreOperation::Transaction)?;
        state.snapshot = None;
        state.writer = None;
        Ok(())
    }

    async fn abort(&self) -> StoreResult<()> {
        if !self.transactional {
            return Ok(());
        }
        let mut state = self.state(StoreOperation::Transaction)?;
        if let Some(snapshot) = state.snapshot.take() {
            state.data = snapshot;
        }
        state.writer = None;
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, owner: &str, lease: Duration) -> StoreResult<Option<LockHolder>> {
        let op = StoreOperation::Lock;
        let lease = chrono::Duration::from_std(lease).map_err(|err| StoreError::new(op, err))?;
        let mut state = self.state(op)?;
        let now = Utc::now();

        if let Some(holder) = state.locks.get(name)
            && holder.owner != owner
            && holder.expires_at > now
        {
            return Ok(Some(holder.clone()));
        }

        state.locks.insert(
            name.to_string(),
            LockHolder {
                owner: owner.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(None)
    }

    async fn release_lock(&self, name: &str, owner: &str) -> StoreResult<bool> {
        let mut state = self.state(StoreOperation::Lock)?;
        if state.locks.get(name).is_some_and(|holder| holder.owner == owner) {
            state.locks.remove(name);
            return Ok(true);
        }
        Ok(false)
    }
}
