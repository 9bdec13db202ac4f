//! Error types for Keel operations

use std::fmt;
use thiserror::Error;

/// Faults raised by a storage backend binding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Table not found: {table}")]
    TableNotFound { table: String },

    #[error("Table already exists: {table}")]
    TableAlreadyExists { table: String },

    #[error("Index {index} not found on table {table}")]
    IndexNotFound { table: String, index: String },

    #[error("Invalid item for table {table}: {reason}")]
    InvalidItem { table: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Encoding and decoding errors for event payloads and persisted records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("No codec registered for topic {topic}")]
    UnknownTopic { topic: String },

    #[error("Body of {topic} does not decode: {reason}")]
    InvalidBody { topic: String, reason: String },

    #[error("Malformed record: {reason}")]
    Malformed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Caller input rejected before touching storage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Stream {bucket_id}/{stream_id} has no pending events to commit")]
    EmptyCommit { bucket_id: String, stream_id: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to read configuration from {path}: {reason}")]
    Io { path: String, reason: String },
}

/// The store operation during which a backend fault surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Append,
    DetectDuplicate,
    GetCommits,
    GetCommitsTo,
    GetSnapshot,
    AddSnapshot,
    Initialize,
    Drop,
}

impl Operation {
    /// Stable lowercase name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Append => "append",
            Operation::DetectDuplicate => "detect_duplicate",
            Operation::GetCommits => "get",
            Operation::GetCommitsTo => "get_to",
            Operation::GetSnapshot => "get_snapshot",
            Operation::AddSnapshot => "add_snapshot",
            Operation::Initialize => "initialize",
            Operation::Drop => "drop",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Master error type for all Keel errors.
///
/// Optimistic-concurrency conflicts and duplicate snapshots are not errors;
/// they are reported through the outcome enums of the services.
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    #[error("Backend failure during {operation} on stream {bucket_id}/{stream_id}: {source}")]
    Backend {
        operation: Operation,
        bucket_id: String,
        stream_id: String,
        source: BackendError,
    },

    #[error("Backend failure during {operation} on table {table}: {source}")]
    Schema {
        operation: Operation,
        table: String,
        source: BackendError,
    },

    #[error("Decode failure on stream {bucket_id}/{stream_id}: {source}")]
    Decode {
        bucket_id: String,
        stream_id: String,
        source: CodecError,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl EventStoreError {
    /// Whether the underlying fault came from the storage backend.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            EventStoreError::Backend { .. } | EventStoreError::Schema { .. }
        )
    }

    /// The backend fault, if this error wraps one.
    pub fn backend_source(&self) -> Option<&BackendError> {
        match self {
            EventStoreError::Backend { source, .. } | EventStoreError::Schema { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Result type alias for Keel operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

// =============================================================================
// TESTS
// =============================================================================
