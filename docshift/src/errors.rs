use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::changeset::ChangesetId;

/// Boxed cause carried by [`StoreError`].
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Store verb that produced a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Insert,
    Update,
    Delete,
    CreateIndex,
    Find,
    Transaction,
    Lock,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOperation::Insert => "insert",
            StoreOperation::Update => "update",
            StoreOperation::Delete => "delete",
            StoreOperation::CreateIndex => "create_index",
            StoreOperation::Find => "find",
            StoreOperation::Transaction => "transaction",
            StoreOperation::Lock => "lock",
        };
        f.write_str(name)
    }
}

/// Failure reported by a store adapter. Adapters never retry.
#[derive(Debug, Error)]
#[error("{operation} failed: {cause}")]
pub struct StoreError {
    pub operation: StoreOperation,
    #[source]
    pub cause: BoxedCause,
}

impl StoreError {
    pub fn new(operation: StoreOperation, cause: impl Into<BoxedCause>) -> Self {
        Self {
            operation,
            cause: cause.into(),
        }
    }
}

/// Convenience alias for store adapter results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while validating, applying or reverting changesets.
#[derive(Debug, Error)]
pub enum ChangesetError {
    /// Two changesets share an id within the same context or target.
    #[error("duplicate changeset {id} in context '{context}'")]
    DuplicateChangeset { id: ChangesetId, context: String },

    /// Recorded checksum no longer matches the supplied changeset content.
    #[error("changeset {id} has drifted (recorded checksum {recorded}, current {current})")]
    ChangesetDrift {
        id: ChangesetId,
        recorded: String,
        current: String,
    },

    /// An operation inside a changeset failed; the changeset was not recorded.
    #[error("changeset {id} failed at operation #{}: {cause}", .index + 1)]
    ChangesetApplication {
        id: ChangesetId,
        /// Zero-based position of the failing operation.
        index: usize,
        #[source]
        cause: StoreError,
    },

    /// Store failure outside of a changeset body (ledger, bootstrap, transactions).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another runner holds a live lease on the target.
    #[error("target '{target}' is locked by {holder} until {expires_at}")]
    LockContention {
        target: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// Malformed changeset input or an unsupported request.
    #[error("invalid changeset: {message}")]
    InvalidChangeset { message: Cow<'static, str> },
}

impl ChangesetError {
    pub fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        ChangesetError::InvalidChangeset {
            message: message.into(),
        }
    }

    /// Changeset the error is about, when it names one.
    pub fn changeset_id(&self) -> Option<&ChangesetId> {
        match self {
            ChangesetError::DuplicateChangeset { id, .. }
            | ChangesetError::ChangesetDrift { id, .. }
            | ChangesetError::ChangesetApplication { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// A run stopped before every pending changeset was applied.
#[derive(Debug, Error)]
#[error("run halted: {error}")]
pub struct RunHalted {
    #[source]
    pub error: ChangesetError,
    /// Newest changeset still applied to the target when the run stopped,
    /// whether this run or an earlier one applied it.
    pub last_applied: Option<ChangesetId>,
    /// Changeset that caused the halt, if the error names one.
    pub failed: Option<ChangesetId>,
}

impl RunHalted {
    pub fn new(error: ChangesetError, last_applied: Option<ChangesetId>) -> Self {
        let failed = error.changeset_id().cloned();
        Self {
            error,
            last_applied,
            failed,
        }
    }
}

impl From<ChangesetError> for RunHalted {
    fn from(error: ChangesetError) -> Self {
        RunHalted::new(error, None)
    }
}

impl From<StoreError> for RunHalted {
    fn from(error: StoreError) -> Self {
        RunHalted::new(ChangesetError::Store(error), None)
    }
}

/// Errors raised while reading changeset files from disk.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("changeset directory {} does not exist", path.display())]
    MissingDirectory { path: PathBuf },
}
