//! Structured error types for the backup core
//!
//! One taxonomy for every failure the subsystem can produce, with machine
//! codes for admin surfaces and an explicit retryability signal: transient
//! store errors are retried on the next scheduled cycle, everything else
//! surfaces to the caller that asked for the operation.

use std::fmt;

/// Backup subsystem error types with proper categorization
#[derive(Debug)]
pub enum BackupError {
    /// Network/auth blip against the blob, graph, or relational store.
    /// Never fatal to the worker; retried on the next cycle.
    TransientStore { store: String, message: String },

    /// Requested blob does not exist. Not retryable.
    NotFound(String),

    /// Snapshot failed to decompress or parse.
    CorruptSnapshot(String),

    /// Expected relational table missing; sub-export degrades to empty.
    SchemaAbsent(String),

    /// Admin delete attempted on a protected deletion-backup key.
    ProtectedBackup(String),

    /// Missing/invalid credentials, DSN, or config values.
    /// Fatal at construction time only.
    Configuration(String),

    /// Full-snapshot extraction failed in the underlying store.
    ExportFailed(String),

    /// Restore operation failed; reported accurately to the caller.
    RestoreFailed(String),

    /// JSON (de)serialization failure outside the snapshot codec.
    Serialization(String),

    /// Generic wrapper for external errors.
    Internal(anyhow::Error),
}

impl BackupError {
    /// Machine-readable code for admin surfaces and logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientStore { .. } => "TRANSIENT_STORE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::CorruptSnapshot(_) => "CORRUPT_SNAPSHOT",
            Self::SchemaAbsent(_) => "SCHEMA_ABSENT",
            Self::ProtectedBackup(_) => "PROTECTED_BACKUP",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::ExportFailed(_) => "EXPORT_FAILED",
            Self::RestoreFailed(_) => "RESTORE_FAILED",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a caller should expect a later attempt to succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }

    /// Detailed error message
    pub fn message(&self) -> String {
        match self {
            Self::TransientStore { store, message } => {
                format!("Transient error from {store} store: {message}")
            }
            Self::NotFound(key) => format!("Not found: {key}"),
            Self::CorruptSnapshot(msg) => format!("Corrupt snapshot: {msg}"),
            Self::SchemaAbsent(table) => format!("Table does not exist: {table}"),
            Self::ProtectedBackup(key) => {
                format!("Deletion backups are protected and cannot be deleted: {key}")
            }
            Self::Configuration(msg) => format!("Configuration error: {msg}"),
            Self::ExportFailed(msg) => format!("Export failed: {msg}"),
            Self::RestoreFailed(msg) => format!("Restore failed: {msg}"),
            Self::Serialization(msg) => format!("Serialization error: {msg}"),
            Self::Internal(err) => format!("Internal error: {err}"),
        }
    }

    /// Transient blob-store error
    pub fn transient_blob(message: impl Into<String>) -> Self {
        Self::TransientStore {
            store: "blob".to_string(),
            message: message.into(),
        }
    }

    /// Transient graph-store error
    pub fn transient_graph(message: impl Into<String>) -> Self {
        Self::TransientStore {
            store: "graph".to_string(),
            message: message.into(),
        }
    }

    /// Transient relational-store error
    pub fn transient_relational(message: impl Into<String>) -> Self {
        Self::TransientStore {
            store: "relational".to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for BackupError {}

impl From<anyhow::Error> for BackupError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Type alias for Results using BackupError
pub type Result<T> = std::result::Result<T, BackupError>;
