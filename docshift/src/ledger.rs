//! Applied-changeset ledger.
//!
//! Entries live in a dedicated collection of the same store the changesets
//! mutate. An entry is never edited after it is recorded, except to flag it
//! as rolled back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::changeset::{BOOTSTRAP_CONTEXT, Changeset, ChangesetId, Document, IndexKey, IndexOptions, Operation};
use crate::errors::{StoreError, StoreOperation, StoreResult};
use crate::store::{ID_FIELD, StoreAdapter, UpdateOptions};

/// Collection holding ledger entries.
pub const LEDGER_COLLECTION: &str = "_docshift_ledger";

/// Lease name prefix for per-target run locks.
pub const LOCK_NAME: &str = "_docshift_lock";

/// Index created by the bootstrap changeset.
pub const LEDGER_INDEX: &str = "_docshift_ledger_target_id";

/// How a ledger entry came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Operations ran and succeeded.
    Applied,
    /// Recorded by hand without running the operations.
    MarkedApplied,
    /// Previously applied, since reverted.
    RolledBack,
}

impl Outcome {
    pub fn is_live(self) -> bool {
        matches!(self, Outcome::Applied | Outcome::MarkedApplied)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::MarkedApplied => "marked_applied",
            Outcome::RolledBack => "rolled_back",
        }
    }
}

/// Record of one changeset against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub target: String,
    pub id: ChangesetId,
    pub context: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Execution time in milliseconds
    #[serde(default)]
    pub execution_time_ms: u64,
    /// Number of operations the changeset carried
    #[serde(default)]
    pub operations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn for_changeset(target: &str, changeset: &Changeset, outcome: Outcome) -> Self {
        Self {
            target: target.to_string(),
            id: changeset.id.clone(),
            context: changeset.context.clone(),
            applied_at: Utc::now(),
            checksum: changeset.checksum(),
            outcome,
            author: changeset.author.clone(),
            execution_time_ms: 0,
            operations: changeset.operations.len(),
            rolled_back_at: None,
        }
    }
}

/// The built-in changeset `0` that prepares the ledger collection.
pub fn bootstrap_changeset() -> Changeset {
    Changeset::new(ChangesetId::zero(), BOOTSTRAP_CONTEXT)
        .with_description("create the changeset ledger index")
        .with_operation(Operation::CreateIndex {
            collection: LEDGER_COLLECTION.to_string(),
            keys: vec![IndexKey::asc("target"), IndexKey::asc("id"), IndexKey::asc("applied_at")],
            options: IndexOptions {
                name: Some(LEDGER_INDEX.to_string()),
                unique: true,
            },
        })
}

fn to_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn live_outcomes() -> Value {
    json!({"$in": [Outcome::Applied.as_str(), Outcome::MarkedApplied.as_str()]})
}

/// Ledger view over a store.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn StoreAdapter>,
}

impl Ledger {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store }
    }

    /// Whether `id` is currently applied to `target`.
    pub async fn has(&self, target: &str, id: &ChangesetId) -> StoreResult<bool> {
        let filter = to_document(json!({
            "target": target,
            "id": id.to_string(),
            "outcome": live_outcomes(),
        }));
        Ok(!self.store.find(LEDGER_COLLECTION, &filter).await?.is_empty())
    }

    /// Append an entry.
    pub async fn record(&self, entry: &LedgerEntry) -> StoreResult<()> {
        let op = StoreOperation::Insert;
        let value = serde_json::to_value(entry).map_err(|err| StoreError::new(op, err))?;
        let mut doc = to_document(value);
        doc.insert(
            ID_FIELD.to_string(),
            Value::String(format!("{}:{}:{}", entry.target, entry.id, nanoid!())),
        );
        self.store.insert(LEDGER_COLLECTION, &[doc]).await?;
        Ok(())
    }

    /// All entries for a target, ordered by changeset id then application time.
    pub async fn entries_for(&self, target: &str) -> StoreResult<Vec<LedgerEntry>> {
        let filter = to_document(json!({"target": target}));
        let mut entries = Vec::new();
        for doc in self.store.find(LEDGER_COLLECTION, &filter).await? {
            let entry: LedgerEntry =
                serde_json::from_value(Value::Object(doc)).map_err(|err| StoreError::new(StoreOperation::Find, err))?;
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id).then(a.applied_at.cmp(&b.applied_at)));
        Ok(entries)
    }

    /// Live entry for `id`, or the most recent rolled-back one.
    pub async fn get(&self, target: &str, id: &ChangesetId) -> StoreResult<Option<LedgerEntry>> {
        let entries: Vec<LedgerEntry> = self
            .entries_for(target)
            .await?
            .into_iter()
            .filter(|entry| &entry.id == id)
            .collect();
        let live = entries.iter().rev().find(|entry| entry.outcome.is_live()).cloned();
        Ok(live.or_else(|| entries.last().cloned()))
    }

    /// Live entries only, ordered by changeset id.
    pub async fn live_entries(&self, target: &str) -> StoreResult<Vec<LedgerEntry>> {
        let mut entries = self.entries_for(target).await?;
        entries.retain(|entry| entry.outcome.is_live());
        Ok(entries)
    }

    /// Flag the live entry for `id` as rolled back. Returns false if none was live.
    pub async fn mark_rolled_back(&self, target: &str, id: &ChangesetId) -> StoreResult<bool> {
        let filter = to_document(json!({
            "target": target,
            "id": id.to_string(),
            "outcome": live_outcomes(),
        }));
        let mutation = to_document(json!({
            "$set": {
                "outcome": Outcome::RolledBack.as_str(),
                "rolled_back_at": Utc::now(),
            }
        }));
        let updated = self
            .store
            .update(LEDGER_COLLECTION, &filter, &mutation, UpdateOptions::default())
            .await?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn changeset(id: &str) -> Changeset {
        Changeset::new(id.parse().unwrap(), "dev").with_operation(Operation::Insert {
            collection: "users".to_string(),
            documents: vec![to_document(json!({"name": "John"}))],
        })
    }

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn record_then_has() {
        let ledger = ledger();
        let cs = changeset("4.1");
        assert!(!ledger.has("dev", &cs.id).await.unwrap());

        ledger
            .record(&LedgerEntry::for_changeset("dev", &cs, Outcome::Applied))
            .await
            .unwrap();

        assert!(ledger.has("dev", &cs.id).await.unwrap());
        assert!(!ledger.has("prod", &cs.id).await.unwrap());
    }

    #[tokio::test]
    async fn entries_are_ordered_by_id() {
        let ledger = ledger();
        for id in ["11", "4.2", "9", "4.10"] {
            ledger
                .record(&LedgerEntry::for_changeset("dev", &changeset(id), Outcome::Applied))
                .await
                .unwrap();
        }
        let ids: Vec<String> = ledger
            .entries_for("dev")
            .await
            .unwrap()
            .iter()
            .map(|entry| entry.id.to_string())
            .collect();
        assert_eq!(ids, ["4.2", "4.10", "9", "11"]);
    }

    #[tokio::test]
    async fn rolled_back_entries_are_not_live() {
        let ledger = ledger();
        let cs = changeset("12");
        ledger
            .record(&LedgerEntry::for_changeset("dev", &cs, Outcome::MarkedApplied))
            .await
            .unwrap();

        assert!(ledger.mark_rolled_back("dev", &cs.id).await.unwrap());
        assert!(!ledger.mark_rolled_back("dev", &cs.id).await.unwrap());
        assert!(!ledger.has("dev", &cs.id).await.unwrap());

        let entry = ledger.get("dev", &cs.id).await.unwrap().expect("entry kept");
        assert_eq!(entry.outcome, Outcome::RolledBack);
        assert!(entry.rolled_back_at.is_some());
        assert!(ledger.live_entries("dev").await.unwrap().is_empty());
    }

    #[test]
    fn entry_serializes_outcome_in_snake_case() {
        let entry = LedgerEntry::for_changeset("dev", &changeset("1"), Outcome::MarkedApplied);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"outcome\":\"marked_applied\""));
        assert!(json.contains("\"id\":\"1\""));
    }

    #[test]
    fn bootstrap_is_changeset_zero() {
        let bootstrap = bootstrap_changeset();
        assert!(bootstrap.id.is_zero());
        assert_eq!(bootstrap.context, BOOTSTRAP_CONTEXT);
        assert_eq!(bootstrap.operations.len(), 1);
    }
}
