//! State store errors.

use refresh_core::{AppNameError, Ordinal};
use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be opened or created.
    #[error("cannot open state database: {0}")]
    Open(String),

    /// Beginning or committing a read/write transaction failed.
    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    #[error("cannot read stored record: {0}")]
    Read(String),

    #[error("cannot write record: {0}")]
    Write(String),

    #[error("cannot encode record: {0}")]
    Serialize(String),

    /// A stored record no longer matches the current schema.
    #[error("stored record is corrupt or from an incompatible version: {0}")]
    Deserialize(String),

    #[error("unknown unit {app}/{ordinal}")]
    UnknownUnit { app: String, ordinal: Ordinal },

    /// Rejected before touching the database: the name would collide with
    /// another application's keys.
    #[error(transparent)]
    InvalidAppName(#[from] AppNameError),

    /// The session changed since it was read.
    #[error("session for {app} changed concurrently (expected generation {expected:?}, found {found:?})")]
    Conflict {
        app: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
}
