//! Declarative changeset model.
//!
//! A changeset is an ordered list of store operations tagged with a context
//! and a version id. Changesets are plain data: they are loaded from disk (see
//! [`crate::loader`]) or built in code, and interpreted by the
//! [`Runner`](crate::runner::Runner).

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::{ChangesetError, StoreOperation};
use crate::keys::is_valid_collection;

/// A JSON document, filter or mutation.
pub type Document = Map<String, Value>;

/// Context used by the built-in ledger bootstrap changeset.
pub const BOOTSTRAP_CONTEXT: &str = "_docshift";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Segment {
    Number(u64),
    Text(String),
}

/// Dotted version identifier such as `4`, `4.1` or `2024.03.release`.
///
/// Segments compare left to right. Numeric segments compare numerically and
/// sort before text segments; an id that is a prefix of another sorts first.
/// Equality follows the same rules, so `4.01` and `4.1` are the same id.
#[derive(Debug, Clone)]
pub struct ChangesetId {
    segments: Vec<Segment>,
}

impl ChangesetId {
    /// Reserved id of the ledger bootstrap changeset.
    pub fn zero() -> Self {
        Self {
            segments: vec![Segment::Number(0)],
        }
    }

    /// Single-segment numeric id.
    pub fn version(version: u64) -> Self {
        Self {
            segments: vec![Segment::Number(version)],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.segments == [Segment::Number(0)]
    }
}

impl FromStr for ChangesetId {
    type Err = ChangesetError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ChangesetError::invalid("changeset id must not be empty"));
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() {
                return Err(ChangesetError::invalid(format!("changeset id '{raw}' has an empty segment")));
            }
            if !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                return Err(ChangesetError::invalid(format!(
                    "changeset id '{raw}' contains unsupported characters"
                )));
            }
            if part.chars().all(|c| c.is_ascii_digit()) {
                let number = part
                    .parse::<u64>()
                    .map_err(|_| ChangesetError::invalid(format!("changeset id segment '{part}' is too large")))?;
                segments.push(Segment::Number(number));
            } else {
                segments.push(Segment::Text(part.to_string()));
            }
        }

        Ok(Self { segments })
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            match segment {
                Segment::Number(n) => write!(f, "{n}")?,
                Segment::Text(text) => f.write_str(text)?,
            }
        }
        Ok(())
    }
}

impl PartialEq for ChangesetId {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for ChangesetId {}

impl Hash for ChangesetId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.segments.hash(state);
    }
}

impl PartialOrd for ChangesetId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChangesetId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.cmp(&other.segments)
    }
}

impl Serialize for ChangesetId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangesetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(u64),
            Text(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Number(n) => Ok(ChangesetId::version(n)),
            RawId::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Index key: a field path with a direction. Written as `"field"` or `"-field"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndexKey {
    pub field: String,
    pub descending: bool,
}

impl IndexKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }
}

impl TryFrom<String> for IndexKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let (field, descending) = match raw.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (raw.as_str(), false),
        };
        if field.is_empty() {
            return Err(format!("invalid index key '{raw}'"));
        }
        Ok(Self {
            field: field.to_string(),
            descending,
        })
    }
}

impl From<IndexKey> for String {
    fn from(key: IndexKey) -> Self {
        if key.descending {
            format!("-{}", key.field)
        } else {
            key.field
        }
    }
}

/// Options accepted by [`Operation::CreateIndex`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexOptions {
    /// Explicit name, or `<collection>_<field>_<field>...`.
    pub fn resolved_name(&self, collection: &str, keys: &[IndexKey]) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => {
                let mut name = collection.to_string();
                for key in keys {
                    name.push('_');
                    name.push_str(&key.field.replace('.', "_"));
                }
                name
            }
        }
    }
}

/// One declarative store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Insert {
        collection: String,
        documents: Vec<Document>,
    },
    Update {
        collection: String,
        #[serde(default)]
        filter: Document,
        mutation: Document,
        #[serde(default)]
        multi: bool,
        #[serde(default)]
        upsert: bool,
    },
    Delete {
        collection: String,
        #[serde(default)]
        filter: Document,
        #[serde(default)]
        multi: bool,
    },
    CreateIndex {
        collection: String,
        keys: Vec<IndexKey>,
        #[serde(default)]
        options: IndexOptions,
    },
}

impl Operation {
    pub fn collection(&self) -> &str {
        match self {
            Operation::Insert { collection, .. }
            | Operation::Update { collection, .. }
            | Operation::Delete { collection, .. }
            | Operation::CreateIndex { collection, .. } => collection,
        }
    }

    pub fn kind(&self) -> StoreOperation {
        match self {
            Operation::Insert { .. } => StoreOperation::Insert,
            Operation::Update { .. } => StoreOperation::Update,
            Operation::Delete { .. } => StoreOperation::Delete,
            Operation::CreateIndex { .. } => StoreOperation::CreateIndex,
        }
    }

    fn validate(&self) -> Result<(), ChangesetError> {
        if self.collection().trim().is_empty() {
            return Err(ChangesetError::invalid(format!("{} operation without a collection", self.kind())));
        }
        if !is_valid_collection(self.collection()) {
            return Err(ChangesetError::invalid(format!(
                "collection name '{}' contains ':' or a glob character",
                self.collection()
            )));
        }
        match self {
            Operation::Update { mutation, .. } if mutation.is_empty() => {
                Err(ChangesetError::invalid("update operation with an empty mutation"))
            }
            Operation::CreateIndex { keys, .. } if keys.is_empty() => {
                Err(ChangesetError::invalid("create_index operation without keys"))
            }
            _ => Ok(()),
        }
    }
}

/// Ordered, versioned unit of mutation tied to a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ChangesetId,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback: Vec<Operation>,
}

#[derive(Serialize)]
struct ChecksumView<'a> {
    id: &'a ChangesetId,
    context: &'a str,
    operations: &'a [Operation],
    rollback: &'a [Operation],
}

impl Changeset {
    pub fn new(id: ChangesetId, context: impl Into<String>) -> Self {
        Self {
            id,
            context: context.into(),
            author: None,
            description: None,
            operations: Vec::new(),
            rollback: Vec::new(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_rollback(mut self, operation: Operation) -> Self {
        self.rollback.push(operation);
        self
    }

    /// SHA-256 over the canonical JSON of id, context, operations and rollback.
    ///
    /// Author and description are metadata and do not affect the checksum.
    pub fn checksum(&self) -> String {
        let view = ChecksumView {
            id: &self.id,
            context: &self.context,
            operations: &self.operations,
            rollback: &self.rollback,
        };
        // Going through Value sorts every object's keys.
        let canonical = serde_json::to_value(&view)
            .map(|value| value.to_string())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Structural checks for user-supplied changesets.
    pub fn validate(&self) -> Result<(), ChangesetError> {
        if self.id.is_zero() {
            return Err(ChangesetError::invalid("changeset id 0 is reserved for the ledger bootstrap"));
        }
        if self.context.trim().is_empty() {
            return Err(ChangesetError::invalid(format!("changeset {} has no context", self.id)));
        }
        for operation in self.operations.iter().chain(&self.rollback) {
            operation.validate().map_err(|err| match err {
                ChangesetError::InvalidChangeset { message } => {
                    ChangesetError::invalid(format!("changeset {}: {message}", self.id))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: &str) -> ChangesetId {
        raw.parse().expect("valid id")
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn ids_order_numerically_by_segment() {
        let mut ids = vec![id("41"), id("4.10"), id("11"), id("4"), id("4.2"), id("9")];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["4", "4.2", "4.10", "9", "11", "41"]);
    }

    #[test]
    fn numeric_segments_sort_before_text() {
        assert!(id("2024.1") < id("2024.hotfix"));
        assert!(id("alpha") < id("beta"));
    }

    #[test]
    fn leading_zeros_do_not_change_identity() {
        assert_eq!(id("4.01"), id("4.1"));
        assert_eq!(id("4.01").to_string(), "4.1");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("".parse::<ChangesetId>().is_err());
        assert!("4..1".parse::<ChangesetId>().is_err());
        assert!("4.".parse::<ChangesetId>().is_err());
        assert!("v 1".parse::<ChangesetId>().is_err());
    }

    #[test]
    fn id_deserializes_from_number_or_string() {
        let from_number: ChangesetId = serde_json::from_value(json!(12)).unwrap();
        let from_text: ChangesetId = serde_json::from_value(json!("12")).unwrap();
        assert_eq!(from_number, from_text);
        assert_eq!(serde_json::to_value(&from_number).unwrap(), json!("12"));
    }

    #[test]
    fn operation_uses_op_tag() {
        let op: Operation = serde_json::from_value(json!({
            "op": "update",
            "collection": "users",
            "filter": {"email": "john@example.com"},
            "mutation": {"$set": {"age": 31}}
        }))
        .unwrap();
        match op {
            Operation::Update { multi, upsert, .. } => {
                assert!(!multi);
                assert!(!upsert);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn collection_names_cannot_reach_other_keys() {
        let archive = Changeset::new(ChangesetId::version(7), "dev").with_operation(Operation::Delete {
            collection: "users:archive".to_string(),
            filter: Document::new(),
            multi: true,
        });
        assert!(matches!(archive.validate(), Err(ChangesetError::InvalidChangeset { .. })));

        let lock = Changeset::new(ChangesetId::version(8), "dev").with_operation(Operation::Delete {
            collection: "lock".to_string(),
            filter: Document::new(),
            multi: true,
        });
        assert!(lock.validate().is_ok());
    }

    #[test]
    fn index_keys_parse_direction() {
        let keys: Vec<IndexKey> = serde_json::from_value(json!(["test_id", "-created_date"])).unwrap();
        assert_eq!(keys[0], IndexKey::asc("test_id"));
        assert!(keys[1].descending);
        assert_eq!(
            IndexOptions::default().resolved_name("security_test", &keys),
            "security_test_test_id_created_date"
        );
    }

    #[test]
    fn checksum_ignores_metadata_and_key_order() {
        let a = Changeset::new(ChangesetId::version(1), "dev").with_operation(Operation::Insert {
            collection: "users".to_string(),
            documents: vec![doc(json!({"name": "John", "age": 30}))],
        });
        let b = Changeset::new(ChangesetId::version(1), "dev")
            .with_author("someone")
            .with_operation(Operation::Insert {
                collection: "users".to_string(),
                documents: vec![doc(json!({"age": 30, "name": "John"}))],
            });
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn checksum_tracks_operation_content() {
        let base = Changeset::new(ChangesetId::version(2), "dev").with_operation(Operation::Delete {
            collection: "users".to_string(),
            filter: doc(json!({"age": {"$lt": 18}})),
            multi: true,
        });
        let mut edited = base.clone();
        edited.operations[0] = Operation::Delete {
            collection: "users".to_string(),
            filter: doc(json!({"age": {"$lt": 21}})),
            multi: true,
        };
        assert_ne!(base.checksum(), edited.checksum());
    }

    #[test]
    fn validate_rejects_reserved_id_and_empty_mutation() {
        assert!(Changeset::new(ChangesetId::zero(), "dev").validate().is_err());

        let bad = Changeset::new(ChangesetId::version(3), "dev").with_operation(Operation::Update {
            collection: "users".to_string(),
            filter: Document::new(),
            mutation: Document::new(),
            multi: false,
            upsert: false,
        });
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("changeset 3"));
    }
}
