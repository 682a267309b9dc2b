//! Error types for the sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Conflict detected: {0}")]
    Conflict(String),

    #[error("Version mismatch for {collection}/{id}: expected {expected}, remote has {actual}")]
    VersionMismatch {
        collection: String,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Sync operation failed: {0}")]
    SyncFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote store returned status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Device is offline")]
    Offline,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key storage error: {0}")]
    KeyStore(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether a later retry of the same operation can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Offline => true,
            SyncError::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SyncError::Remote {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => SyncError::Network(err.to_string()),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Network("reset".to_string()).is_transient());
        assert!(SyncError::Offline.is_transient());
        assert!(SyncError::Remote { status: 503, message: String::new() }.is_transient());
        assert!(!SyncError::Remote { status: 400, message: String::new() }.is_transient());
        assert!(!SyncError::NotFound("x".to_string()).is_transient());
    }
}
