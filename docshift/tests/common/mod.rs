#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docshift::changeset::{Changeset, Document, IndexKey, IndexOptions, Operation};
use docshift::errors::{StoreError, StoreOperation, StoreResult};
use docshift::ledger::LEDGER_COLLECTION;
use docshift::store::{LockHolder, MemoryStore, StoreAdapter, UpdateOptions};
use serde_json::{Value, json};

/// MemoryStore wrapper that records every mutation and can fail one on demand.
pub struct FlakyStore {
    inner: MemoryStore,
    calls: Mutex<Vec<String>>,
    /// Countdown of data mutations (ledger writes excluded) before one fails.
    fail_in: Mutex<Option<usize>>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::wrap(MemoryStore::new()))
    }

    pub fn without_transactions() -> Arc<Self> {
        Arc::new(Self::wrap(MemoryStore::without_transactions()))
    }

    fn wrap(inner: MemoryStore) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_in: Mutex::new(None),
        }
    }

    /// Make the `nth` data mutation from now on fail (1-based).
    pub fn fail_nth_mutation(&self, nth: usize) {
        *self.fail_in.lock().unwrap() = Some(nth);
    }

    /// Every insert/update/delete/create_index call so far, as "verb collection".
    pub fn mutations(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner.find(collection, &Document::new()).await.unwrap()
    }

    fn track(&self, op: StoreOperation, collection: &str) -> StoreResult<()> {
        self.calls.lock().unwrap().push(format!("{op} {collection}"));
        if collection == LEDGER_COLLECTION {
            return Ok(());
        }
        let mut fail_in = self.fail_in.lock().unwrap();
        match fail_in.as_mut() {
            Some(remaining) if *remaining <= 1 => {
                *fail_in = None;
                Err(StoreError::new(op, "injected failure"))
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StoreAdapter for FlakyStore {
    fn kind(&self) -> &'static str {
        "flaky-memory"
    }

    async fn insert(&self, collection: &str, documents: &[Document]) -> StoreResult<u64> {
        self.track(StoreOperation::Insert, collection)?;
        self.inner.insert(collection, documents).await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Document,
        mutation: &Document,
        options: UpdateOptions,
    ) -> StoreResult<u64> {
        self.track(StoreOperation::Update, collection)?;
        self.inner.update(collection, filter, mutation, options).await
    }

    async fn delete(&self, collection: &str, filter: &Document, multi: bool) -> StoreResult<u64> {
        self.track(StoreOperation::Delete, collection)?;
        self.inner.delete(collection, filter, multi).await
    }

    async fn create_index(&self, collection: &str, keys: &[IndexKey], options: &IndexOptions) -> StoreResult<()> {
        self.track(StoreOperation::CreateIndex, collection)?;
        self.inner.create_index(collection, keys, options).await
    }

    async fn find(&self, collection: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        self.inner.find(collection, filter).await
    }

    fn supports_transactions(&self) -> bool {
        self.inner.supports_transactions()
    }

    async fn begin(&self) -> StoreResult<()> {
        self.inner.begin().await
    }

    async fn commit(&self) -> StoreResult<()> {
        self.inner.commit().await
    }

    async fn abort(&self) -> StoreResult<()> {
        self.inner.abort().await
    }

    async fn acquire_lock(&self, name: &str, owner: &str, lease: Duration) -> StoreResult<Option<LockHolder>> {
        self.inner.acquire_lock(name, owner, lease).await
    }

    async fn release_lock(&self, name: &str, owner: &str) -> StoreResult<bool> {
        self.inner.release_lock(name, owner).await
    }
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn changeset(id: &str, context: &str) -> Changeset {
    Changeset::new(id.parse().unwrap(), context)
}

/// v1 inserts two users, v2 bumps Bob's age, v3 deletes minors.
pub fn users_scenario(context: &str) -> Vec<Changeset> {
    vec![
        changeset("1", context)
            .with_description("seed users")
            .with_operation(Operation::Insert {
                collection: "users".to_string(),
                documents: vec![
                    doc(json!({"name": "Ann", "age": 25})),
                    doc(json!({"name": "Bob", "age": 40})),
                ],
            })
            .with_rollback(Operation::Delete {
                collection: "users".to_string(),
                filter: doc(json!({"name": {"$in": ["Ann", "Bob"]}})),
                multi: true,
            }),
        changeset("2", context)
            .with_operation(Operation::Update {
                collection: "users".to_string(),
                filter: doc(json!({"name": "Bob"})),
                mutation: doc(json!({"$set": {"age": 41}})),
                multi: false,
                upsert: false,
            })
            .with_rollback(Operation::Update {
                collection: "users".to_string(),
                filter: doc(json!({"name": "Bob"})),
                mutation: doc(json!({"$set": {"age": 40}})),
                multi: false,
                upsert: false,
            }),
        changeset("3", context).with_operation(Operation::Delete {
            collection: "users".to_string(),
            filter: doc(json!({"age": {"$lt": 18}})),
            multi: true,
        }),
    ]
}

/// (name, age) pairs of every user, sorted by name.
pub async fn users(store: &FlakyStore) -> Vec<(String, i64)> {
    let mut users: Vec<(String, i64)> = store
        .documents("users")
        .await
        .iter()
        .map(|doc| {
            (
                doc["name"].as_str().unwrap_or_default().to_string(),
                doc["age"].as_i64().unwrap_or_default(),
            )
        })
        .collect();
    users.sort();
    users
}
