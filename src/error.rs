//! Error types for the appenderator.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for appenderator operations.
pub type Result<T> = std::result::Result<T, AppenderatorError>;

/// Main error type for appenderator operations.
#[derive(Error, Debug)]
pub enum AppenderatorError {
    #[error("Batch appenderator does not need a committer")]
    CommitterNotSupported,

    #[error("Batch appenderator should always allow incremental persists")]
    IncrementalPersistsRequired,

    #[error("Expected dataSource '{expected}' but was asked to insert row for dataSource '{actual}'")]
    WrongDataSource { expected: String, actual: String },

    #[error("Attempt to add row to swapped-out sink for segment '{identifier}'")]
    SegmentNotWritable { identifier: String },

    #[error("Index is full: {rows} rows, {bytes} bytes in memory")]
    IndexSizeExceeded { rows: usize, bytes: u64 },

    #[error("No such segment: {identifier}")]
    SegmentNotFound { identifier: String },

    #[error("Error while persisting: {0}")]
    PersistFailed(String),

    #[error(
        "Exceeded safe estimated heap usage limits, failing \
         (numSinks: [{num_sinks}] numHydrantsAcrossAllSinks: [{num_hydrants}] totalRows: [{total_rows}]) \
         (bytesCurrentlyInMemory: [{bytes_in_memory}] - bytesToBePersisted: [{bytes_to_be_persisted}] \
         > maxBytesInMemory: [{max_bytes_in_memory}]). This can occur when the overhead from too many \
         intermediary segment persists becomes too great to leave enough space for additional input rows. \
         The check can be disabled by setting 'skip_bytes_in_memory_overhead_check' to 'true' (which may \
         allow the process to run out of memory), or 'max_bytes_in_memory' can be increased to allow more \
         intermediary segment persists before reaching this condition"
    )]
    HeapLimitExceeded {
        num_sinks: usize,
        num_hydrants: usize,
        total_rows: usize,
        bytes_in_memory: i64,
        bytes_to_be_persisted: i64,
        max_bytes_in_memory: i64,
    },

    #[error("Cannot acquire lock on base persist directory: {path:?}")]
    LockUnavailable { path: PathBuf },

    #[error("Queries not supported on this appenderator")]
    QueriesNotSupported,

    #[error("Appenderator job not started; call start_job first")]
    NotStarted,

    #[error("Appenderator is shutting down")]
    ShuttingDown,

    #[error("Task on executor '{executor}' was cancelled")]
    TaskCancelled { executor: String },

    #[error("Task on executor '{executor}' panicked")]
    TaskPanicked { executor: String },

    #[error("Task on executor '{executor}' was abandoned before completion")]
    TaskAborted { executor: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl AppenderatorError {
    /// Attaches a path to a bare IO error, for spill and merge failures
    /// where the file involved matters more than the errno.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppenderatorError::IoWithPath {
            path: path.into(),
            source,
        }
    }
}
