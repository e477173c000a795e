//! Error types for the Tether engine.

use crate::{PrimaryKey, RecordName, SchemaVersion, TableName};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Record naming
    #[error("record name '{0}' starts with the reserved prefix '_'")]
    ReservedRecordName(String),

    #[error("record name '{name}' is {len} bytes, exceeding the {limit}-byte limit")]
    RecordNameTooLong {
        name: String,
        len: usize,
        limit: usize,
    },

    // Local row validation
    #[error("table not synchronized: {0}")]
    TableNotSynchronized(TableName),

    #[error("row not found in '{table}': {primary_key}")]
    RowNotFound {
        table: TableName,
        primary_key: PrimaryKey,
    },

    #[error("row already exists in '{table}': {primary_key}")]
    RowAlreadyExists {
        table: TableName,
        primary_key: PrimaryKey,
    },

    #[error("missing required column: {0}")]
    MissingRequiredColumn(String),

    #[error("type mismatch for column '{column}': expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: String,
        got: String,
    },

    #[error("invalid row: {0}")]
    InvalidRow(String),

    // Permission
    #[error("write to '{record_name}' denied: no write permission on the root share")]
    WritePermission { record_name: RecordName },

    // Sharing
    #[error("record in table '{table}' (pk {primary_key}) is not a root: foreign keys {foreign_keys:?}")]
    RecordNotRoot {
        table: TableName,
        primary_key: PrimaryKey,
        foreign_keys: Vec<String>,
    },

    #[error("no sync metadata for '{table}' row {primary_key}")]
    RecordMetadataNotFound {
        table: TableName,
        primary_key: PrimaryKey,
    },

    #[error("sync engine is not running")]
    SyncEngineNotRunning,

    // State
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
