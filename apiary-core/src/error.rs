use thiserror::Error;

use crate::ledger::LedgerError;

/// What kind of record a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    HistoryEntry,
    Bundle,
    Collection,
    PendingOperation,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordKind::HistoryEntry => "history entry",
            RecordKind::Bundle => "bundle",
            RecordKind::Collection => "collection",
            RecordKind::PendingOperation => "pending operation",
        };
        f.write_str(name)
    }
}

/// Recoverable failures returned by the coordinator.
///
/// Lock contention is not in here: a denied lock is an ordinary
/// [`LockDenied`](crate::lock::LockDenied) value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("none of the selected history entries exist")]
    EmptySelection,

    #[error("bundle import failed: {0}")]
    Import(String),

    #[error("{actor} is not a collaborator on collection {collection}")]
    NotCollaborator { collection: String, actor: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CoreError {
    pub(crate) fn not_found(kind: RecordKind, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
