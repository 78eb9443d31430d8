use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("pg_dump failed ({status}): {stderr}")]
    Dump { status: String, stderr: String },

    #[error("Object store {operation} failed: {message}")]
    Store {
        operation: &'static str,
        message: String,
    },

    #[error("Failed to remove local dump file {}: {source}", path.display())]
    LocalCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Short, stable name of the failure kind, used in cycle reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "config",
            BackupError::Dump { .. } => "dump",
            BackupError::Store { .. } => "store",
            BackupError::LocalCleanup { .. } => "local_cleanup",
            BackupError::Timeout { .. } => "timeout",
            BackupError::Io(_) => "io",
        }
    }

    pub(crate) fn store(operation: &'static str, message: impl Into<String>) -> Self {
        BackupError::Store {
            operation,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
