//! Store adapters.
//!
//! The [`StoreAdapter`] trait is the only vocabulary the runner needs from a
//! document store: the four changeset verbs, a read path for the ledger,
//! optional transactions and a lease lock.

mod memory;
mod redis_json;

pub use memory::MemoryStore;
pub use redis_json::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::changeset::{Document, IndexKey, IndexOptions};
use crate::errors::StoreResult;

/// Field that holds a document's identity in every store.
pub const ID_FIELD: &str = "_id";

/// Flags for [`StoreAdapter::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Update every matching document instead of the first one.
    pub multi: bool,
    /// Insert a seed document when nothing matches.
    pub upsert: bool,
}

/// Current holder of a lease lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Document store abstraction used by the runner and the ledger.
///
/// Implementations report failures as [`StoreError`](crate::errors::StoreError)
/// and never retry.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Store type identifier for logging
    fn kind(&self) -> &'static str;

    /// Insert documents, returns the number inserted
    async fn insert(&self, collection: &str, documents: &[Document]) -> StoreResult<u64>;

    /// Apply a mutation to matching documents, returns the number modified or upserted
    async fn update(
        &self,
        collection: &str,
        filter: &Document,
        mutation: &Document,
        options: UpdateOptions,
    ) -> StoreResult<u64>;

    /// Delete matching documents, returns the number deleted
    async fn delete(&self, collection: &str, filter: &Document, multi: bool) -> StoreResult<u64>;

    /// Create an index; re-creating an identical index is a no-op
    async fn create_index(&self, collection: &str, keys: &[IndexKey], options: &IndexOptions) -> StoreResult<()>;

    /// Read matching documents
    async fn find(&self, collection: &str, filter: &Document) -> StoreResult<Vec<Document>>;

    /// Whether begin/commit/abort give all-or-nothing semantics
    fn supports_transactions(&self) -> bool {
        false
    }

    async fn begin(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn abort(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Take the named lease for `owner`.
    ///
    /// Returns `None` when the lease was acquired (or renewed by the same
    /// owner) and the live holder otherwise.
    async fn acquire_lock(&self, name: &str, owner: &str, lease: Duration) -> StoreResult<Option<LockHolder>>;

    /// Release the named lease if `owner` still holds it
    async fn release_lock(&self, name: &str, owner: &str) -> StoreResult<bool>;
}
