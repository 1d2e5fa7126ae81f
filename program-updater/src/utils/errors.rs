//! Error types for the update engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Incomplete transfer: expected {expected} bytes, received {actual}")]
    IncompleteTransfer { expected: u64, actual: u64 },

    #[error("Hash verification failed for {name}: expected {expected}, got {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Process control error: {0}")]
    ProcessControl(String),

    #[error("File transaction failed on {}: {source}", path.display())]
    FileTransaction {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Update cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UpdateError {
    /// Wrap an I/O failure on `path` raised while backing up, replacing or
    /// restoring a file.
    pub fn file_transaction(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpdateError::FileTransaction {
            path: path.into(),
            source,
        }
    }

    /// True when the run stopped because cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }

    /// Network and protocol failures, including short transfers.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            UpdateError::Transport(_) | UpdateError::IncompleteTransfer { .. } | UpdateError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinct_from_failures() {
        assert!(UpdateError::Cancelled.is_cancelled());
        assert!(!UpdateError::Transport("reset".into()).is_cancelled());
        assert!(!UpdateError::Manifest("empty".into()).is_cancelled());
    }

    #[test]
    fn test_incomplete_transfer_is_transport() {
        let err = UpdateError::IncompleteTransfer { expected: 10, actual: 4 };
        assert!(err.is_transport());
        assert_eq!(
            err.to_string(),
            "Incomplete transfer: expected 10 bytes, received 4"
        );
    }

    #[test]
    fn test_file_transaction_display_names_path() {
        let err = UpdateError::file_transaction(
            "/opt/app/app.bin",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/opt/app/app.bin"));
        assert!(!err.is_transport());
    }
}
