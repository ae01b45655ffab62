//! RedisJSON-backed store.
//!
//! Documents live at `<prefix>:doc:<collection>:<_id>` as JSON. Filters are
//! evaluated client-side after a `SCAN` of the collection prefix, so this
//! adapter suits migration-sized collections rather than bulk data. Indexes are
//! RediSearch `FT.CREATE ... ON JSON` indexes. There are no transactions.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use nanoid::nanoid;
use redis::Script;
use redis::aio::ConnectionManager;
use serde_json::Value;

use super::{ID_FIELD, LockHolder, StoreAdapter, UpdateOptions};
use crate::changeset::{Document, IndexKey, IndexOptions};
use crate::document::{apply_mutation, matches, upsert_seed};
use crate::errors::{StoreError, StoreOperation, StoreResult};
use crate::keys::{KeyContext, is_valid_collection};

const SCAN_COUNT: usize = 100;

const ACQUIRE_LOCK_SCRIPT_BODY: &str = include_str!("../../lua/acquire_lock.lua");
const RELEASE_LOCK_SCRIPT_BODY: &str = include_str!("../../lua/release_lock.lua");

static ACQUIRE_LOCK_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(ACQUIRE_LOCK_SCRIPT_BODY));
static RELEASE_LOCK_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(RELEASE_LOCK_SCRIPT_BODY));

fn check_collection(collection: &str, op: StoreOperation) -> StoreResult<()> {
    if is_valid_collection(collection) {
        return Ok(());
    }
    Err(StoreError::new(op, format!("invalid collection name '{collection}'")))
}

/// One field of a RediSearch schema.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SchemaField {
    identifier: String,
    attribute: String,
    kind: String,
}

/// Schema for `keys`. Field types are unknown when an index is created, so
/// every field is a `TAG` (exact match); numeric range queries are not served
/// by these indexes. RediSearch fields have no direction, so a descending key
/// is indexed the same way as an ascending one.
fn schema_fields(keys: &[IndexKey]) -> Vec<SchemaField> {
    keys.iter()
        .map(|key| SchemaField {
            identifier: format!("$.{}", key.field),
            attribute: key.field.replace('.', "_"),
            kind: "TAG".to_string(),
        })
        .collect()
}

fn value_text(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::SimpleString(text) => Some(text.clone()),
        redis::Value::VerbatimString { text, .. } => Some(text.clone()),
        _ => None,
    }
}

/// Key/value pairs of a flat RESP2 array or a RESP3 map.
fn value_pairs(value: &redis::Value) -> Vec<(String, &redis::Value)> {
    match value {
        redis::Value::Array(items) => items
            .chunks(2)
            .filter_map(|pair| match pair {
                [key, value] => Some((value_text(key)?, value)),
                _ => None,
            })
            .collect(),
        redis::Value::Map(entries) => entries
            .iter()
            .filter_map(|(key, value)| Some((value_text(key)?, value)))
            .collect(),
        _ => Vec::new(),
    }
}

/// Schema fields listed under `attributes` in an `FT.INFO` reply.
fn info_fields(info: &redis::Value) -> Vec<SchemaField> {
    let Some((_, redis::Value::Array(attributes))) = value_pairs(info).into_iter().find(|(key, _)| key == "attributes")
    else {
        return Vec::new();
    };
    attributes
        .iter()
        .map(|attribute| {
            let pairs = value_pairs(attribute);
            let text = |name: &str| {
                pairs
                    .iter()
                    .find(|(key, _)| key == name)
                    .and_then(|(_, value)| value_text(value))
                    .unwrap_or_default()
            };
            SchemaField {
                identifier: text("identifier"),
                attribute: text("attribute"),
                kind: text("type"),
            }
        })
        .collect()
}

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Open a connection manager for `url`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        let op = StoreOperation::Find;
        let client = redis::Client::open(url).map_err(|err| StoreError::new(op, err))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|err| StoreError::new(op, err))?;
        Ok(Self::new(conn, prefix))
    }

    /// Delete every key under this store's prefix. Meant for test cleanup;
    /// RediSearch index definitions are left in place.
    pub async fn purge(&self) -> StoreResult<u64> {
        let op = StoreOperation::Delete;
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.prefix);
        let mut cursor: u64 = 0;
        let mut total_deleted: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|err| StoreError::new(op, err))?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| StoreError::new(op, err))?;
                total_deleted += deleted;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(total_deleted)
    }

    fn keys(&self) -> KeyContext<'_> {
        KeyContext::new(&self.prefix)
    }

    /// Every document of a collection with its Redis key.
    async fn scan_collection(&self, collection: &str, op: StoreOperation) -> StoreResult<Vec<(String, Document)>> {
        check_collection(collection, op)?;
        let mut conn = self.conn.clone();
        let pattern = self.keys().collection_pattern(collection);
        let mut documents = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|err| StoreError::new(op, err))?;

            for key in keys {
                let raw: Option<String> = redis::cmd("JSON.GET")
                    .arg(&key)
                    .arg("$")
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| StoreError::new(op, err))?;
                let Some(raw) = raw else {
                    continue;
                };
                // JSON.GET with a `$` path wraps the document in an array.
                let values: Vec<Value> = serde_json::from_str(&raw).map_err(|err| StoreError::new(op, err))?;
                if let Some(Value::Object(doc)) = values.into_iter().next() {
                    documents.push((key, doc));
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        // SCAN order is arbitrary; keep single-document updates deterministic.
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(documents)
    }

    async fn matching(
        &self,
        collection: &str,
        filter: &Document,
        op: StoreOperation,
    ) -> StoreResult<Vec<(String, Document)>> {
        let mut found = Vec::new();
        for (key, doc) in self.scan_collection(collection, op).await? {
            if matches(&doc, filter).map_err(|err| StoreError::new(op, err))? {
                found.push((key, doc));
            }
        }
        Ok(found)
    }

    /// Write a document. With `only_new`, an existing key is left alone and
    /// `false` is returned.
    async fn write_document(&self, key: &str, doc: &Document, only_new: bool, op: StoreOperation) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(doc).map_err(|err| StoreError::new(op, err))?;
        let mut cmd = redis::cmd("JSON.SET");
        cmd.arg(key).arg("$").arg(&json);
        if only_new {
            cmd.arg("NX");
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::new(op, err))?;
        Ok(reply.is_some())
    }

    fn document_key(&self, collection: &str, doc: &mut Document) -> String {
        let id = match doc.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => {
                let id = nanoid!();
                doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };
        self.keys().document(collection, &id)
    }
}

#[async_trait]
impl StoreAdapter for RedisStore {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn insert(&self, collection: &str, documents: &[Document]) -> StoreResult<u64> {
        let op = StoreOperation::Insert;
        check_collection(collection, op)?;
        let mut inserted = 0;
        for doc in documents {
            let mut doc = doc.clone();
            let key = self.document_key(collection, &mut doc);
            if !self.write_document(&key, &doc, true, op).await? {
                return Err(StoreError::new(op, format!("duplicate key {key}")));
            }
            inserted += 1;
        }
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
        let mut targets = self.matching(collection, filter, op).await?;
        if !options.multi {
            targets.truncate(1);
        }

        if targets.is_empty() {
            if !options.upsert {
                return Ok(0);
            }
            let mut seed = upsert_seed(filter, mutation).map_err(|err| StoreError::new(op, err))?;
            let key = self.document_key(collection, &mut seed);
            if !self.write_document(&key, &seed, true, op).await? {
                return Err(StoreError::new(op, format!("duplicate key {key}")));
            }
            return Ok(1);
        }

        let mut modified = 0;
        for (key, mut doc) in targets {
            if apply_mutation(&mut doc, mutation).map_err(|err| StoreError::new(op, err))? {
                self.write_document(&key, &doc, false, op).await?;
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn delete(&self, collection: &str, filter: &Document, multi: bool) -> StoreResult<u64> {
        let op = StoreOperation::Delete;
        let mut targets = self.matching(collection, filter, op).await?;
        if !multi {
            targets.truncate(1);
        }
        if targets.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = targets.into_iter().map(|(key, _)| key).collect();
        let mut conn = self.conn.clone();
        let deleted: u64 = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::new(op, err))?;
        Ok(deleted)
    }

    async fn create_index(&self, collection: &str, keys: &[IndexKey], options: &IndexOptions) -> StoreResult<()> {
        let op = StoreOperation::CreateIndex;
        check_collection(collection, op)?;
        let name = options.resolved_name(collection, keys);
        if options.unique {
            debug!("RediSearch cannot enforce uniqueness; index {name} is advisory");
        }

        let index_key = self.keys().index(&name);
        let wanted = schema_fields(keys);
        let mut cmd = redis::cmd("FT.CREATE");
        cmd.arg(&index_key)
            .arg("ON")
            .arg("JSON")
            .arg("PREFIX")
            .arg(1)
            .arg(self.keys().collection_prefix(collection))
            .arg("SCHEMA");
        for field in &wanted {
            cmd.arg(&field.identifier).arg("AS").arg(&field.attribute).arg(&field.kind);
        }

        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = cmd.query_async(&mut conn).await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("Index already exists") => {
                let info: redis::Value = redis::cmd("FT.INFO")
                    .arg(&index_key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| StoreError::new(op, err))?;
                if info_fields(&info) != wanted {
                    return Err(StoreError::new(op, format!("index {name} exists with a different definition")));
                }
                debug!("index {name} already exists");
                Ok(())
            }
            Err(err) => Err(StoreError::new(op, err)),
        }
    }

    async fn find(&self, collection: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        let found = self.matching(collection, filter, StoreOperation::Find).await?;
        Ok(found.into_iter().map(|(_, doc)| doc).collect())
    }

    async fn acquire_lock(&self, name: &str, owner: &str, lease: Duration) -> StoreResult<Option<LockHolder>> {
        let op = StoreOperation::Lock;
        let mut conn = self.conn.clone();
        let lease_ms = lease.as_millis().max(1) as u64;

        let mut invocation = ACQUIRE_LOCK_SCRIPT.prepare_invoke();
        invocation.key(self.keys().lock(name)).arg(owner).arg(lease_ms);
        let (acquired, holder, ttl_ms): (i64, String, i64) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::new(op, err))?;

        if acquired == 1 {
            return Ok(None);
        }
        Ok(Some(LockHolder {
            owner: holder,
            expires_at: Utc::now() + chrono::Duration::milliseconds(ttl_ms.max(0)),
        }))
    }

    async fn release_lock(&self, name: &str, owner: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = RELEASE_LOCK_SCRIPT.prepare_invoke();
        invocation.key(self.keys().lock(name)).arg(owner);
        let released: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::new(StoreOperation::Lock, err))?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value as Reply;

    fn bulk(text: &str) -> Reply {
        Reply::BulkString(text.as_bytes().to_vec())
    }

    fn attribute(identifier: &str, name: &str, kind: &str) -> Reply {
        Reply::Array(vec![
            bulk("identifier"),
            bulk(identifier),
            bulk("attribute"),
            bulk(name),
            bulk("type"),
            bulk(kind),
            bulk("SEPARATOR"),
            bulk(","),
        ])
    }

    #[test]
    fn schema_is_tag_only_without_direction() {
        let keys = [IndexKey::asc("profile.email"), IndexKey::try_from("-age".to_string()).unwrap()];
        let fields = schema_fields(&keys);
        assert_eq!(
            fields,
            [
                SchemaField {
                    identifier: "$.profile.email".to_string(),
                    attribute: "profile_email".to_string(),
                    kind: "TAG".to_string(),
                },
                SchemaField {
                    identifier: "$.age".to_string(),
                    attribute: "age".to_string(),
                    kind: "TAG".to_string(),
                },
            ]
        );
        assert_eq!(fields[1], schema_fields(&[IndexKey::asc("age")])[0]);
    }

    #[test]
    fn reads_fields_from_resp2_info() {
        let info = Reply::Array(vec![
            bulk("index_name"),
            bulk("docshift:idx:users_email"),
            bulk("attributes"),
            Reply::Array(vec![attribute("$.email", "email", "TAG")]),
            bulk("num_docs"),
            Reply::Int(2),
        ]);
        assert_eq!(info_fields(&info), schema_fields(&[IndexKey::asc("email")]));
        assert_ne!(info_fields(&info), schema_fields(&[IndexKey::asc("name")]));
    }

    #[test]
    fn reads_fields_from_resp3_info() {
        let info = Reply::Map(vec![(
            Reply::SimpleString("attributes".to_string()),
            Reply::Array(vec![Reply::Map(vec![
                (bulk("identifier"), bulk("$.test_id")),
                (bulk("attribute"), bulk("test_id")),
                (bulk("type"), Reply::SimpleString("TAG".to_string())),
            ])]),
        )]);
        assert_eq!(info_fields(&info), schema_fields(&[IndexKey::asc("test_id")]));
        assert!(info_fields(&Reply::Nil).is_empty());
    }

    #[test]
    fn rejects_collections_that_overlap_other_keys() {
        assert!(check_collection("users", StoreOperation::Find).is_ok());
        let err = check_collection("users:archive", StoreOperation::Find).unwrap_err();
        assert_eq!(err.operation, StoreOperation::Find);
    }
}
