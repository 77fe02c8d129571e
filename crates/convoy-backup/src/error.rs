//! Backup error types.

use thiserror::Error;

/// Errors raised while writing, reading or applying a backup.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup uri '{0}'")]
    InvalidUri(String),

    #[error("unsupported backup scheme '{0}': only file:// is available")]
    UnsupportedScheme(String),

    #[error("backup I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed backup archive: {0}")]
    Format(String),

    #[error("backup serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state store error: {0}")]
    State(#[from] convoy_state::StateError),
}

impl BackupError {
    /// Whether the caller supplied a URI that can never work.
    pub fn is_client_error(&self) -> bool {
        matches!(self, BackupError::InvalidUri(_) | BackupError::UnsupportedScheme(_))
    }
}

pub type BackupResult<T> = Result<T, BackupError>;
