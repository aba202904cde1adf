//! Error types for MeshSync

use thiserror::Error;

/// Main error type for MeshSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// A configuration value is out of bounds or inconsistent
    #[error("Invalid {setting}; {reason}")]
    Config {
        /// Name of the offending setting
        setting: String,
        /// What is wrong with it
        reason: String,
    },

    /// Adapter method called before any successful build
    #[error("negentropy adapter not initialized")]
    NotInitialized,

    /// The range-reconciliation primitive rejected a frame or state transition
    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] negentropy::Error),

    /// A wire frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Unexpected or out-of-order protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A timestamp could not be used
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Sync store used before `start()` or after `stop()`
    #[error("Sync store is not started")]
    StoreNotStarted,

    /// Error reported by the ledger collaborator
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Error delivering a message to a peer
    #[error("Transport error: {0}")]
    Transport(String),

    /// A work queue has shut down and no longer accepts tasks
    #[error("Queue closed: {0}")]
    QueueClosed(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Build a configuration error naming the offending setting.
    pub fn config(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Config {
            setting: setting.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
