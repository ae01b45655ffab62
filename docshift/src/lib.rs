//! Docshift core library.
//!
//! Versioned, idempotent changesets for document stores: a changeset model
//! with stable checksums, a ledger of what has been applied per target, and a
//! runner that applies pending changesets in id order.

pub mod changeset;
pub mod document;
pub mod errors;
pub mod keys;
pub mod ledger;
pub mod loader;
pub mod runner;
pub mod store;

pub use changeset::{Changeset, ChangesetId, Document, IndexKey, IndexOptions, Operation};
pub use errors::*;
pub use ledger::{Ledger, LedgerEntry, Outcome};
pub use runner::{ChangesetState, RollbackReport, RunReport, Runner, RunnerOptions, StatusRow, Target};
pub use store::{MemoryStore, RedisStore, StoreAdapter, UpdateOptions};

// Re-export redis types so users don't need to depend on a specific redis version
pub use redis;
pub use redis::aio::ConnectionManager;
