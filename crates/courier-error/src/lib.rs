use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Error type shared across the broker crates.
///
/// Covers the failure classes surfaced to callers: storage failures from the
/// spool, undecodable payloads, credential problems and bad configuration.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("message decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        BrokerError::Storage(msg.into())
    }

    /// Create a stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        BrokerError::Stream(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        BrokerError::Auth(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        BrokerError::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BrokerError::Config(msg.into())
    }
}

// ============================================================================
// Conversion from storage error types
// ============================================================================

impl From<redb::DatabaseError> for BrokerError {
    fn from(err: redb::DatabaseError) -> Self {
        BrokerError::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for BrokerError {
    fn from(err: redb::TransactionError) -> Self {
        BrokerError::Storage(err.to_string())
    }
}

impl From<redb::TableError> for BrokerError {
    fn from(err: redb::TableError) -> Self {
        BrokerError::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for BrokerError {
    fn from(err: redb::StorageError) -> Self {
        BrokerError::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for BrokerError {
    fn from(err: redb::CommitError) -> Self {
        BrokerError::Storage(err.to_string())
    }
}
