//! Error types for Snapshot

use thiserror::Error;

/// Result type alias using Snapshot Error
pub type Result<T> = std::result::Result<T, Error>;

/// Snapshot error types
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope body could not be recognised
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A required envelope field is absent
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Account is not onboarded in the directory
    #[error("Unauthorized account: {0}")]
    UnauthorizedAccount(String),

    /// Resource type string not recognised, or no poller registered for it
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    /// Invalid scan request (e.g. malformed ARN)
    #[error("Invalid scan request: {0}")]
    InvalidScan(String),

    /// Provider read API error, wrapped with call context
    #[error("Provider error: {0}")]
    Provider(String),

    /// Object storage error (log object download)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Scan queue send error
    #[error("Queue error: {0}")]
    Queue(String),

    /// A queue batch was rejected for exceeding the transport size limit
    #[error("Queue batch too large: {0}")]
    BatchTooLarge(String),

    /// Too many deletes for a single inventory call
    #[error("Delete batch of {count} exceeds inventory limit of {limit}")]
    DeleteBatchTooLarge { count: usize, limit: usize },

    /// Inventory API error
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// DynamoDB error
    #[error("Database error: {0}")]
    Database(String),

    /// JSON Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// DynamoDB serialization error
    #[error("DynamoDB serialization error: {0}")]
    DynamoSerialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for structured logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedEnvelope(_) => "malformed_envelope",
            Error::MissingField(_) => "missing_field",
            Error::UnauthorizedAccount(_) => "unauthorized_account",
            Error::UnknownResourceType(_) => "unknown_resource_type",
            Error::InvalidScan(_) => "invalid_scan",
            Error::Provider(_) => "provider_error",
            Error::Storage(_) => "storage_error",
            Error::Queue(_) => "queue_error",
            Error::BatchTooLarge(_) => "batch_too_large",
            Error::DeleteBatchTooLarge { .. } => "delete_batch_too_large",
            Error::Inventory(_) => "inventory_error",
            Error::Database(_) => "database_error",
            Error::Serialization(_) => "serialization_error",
            Error::DynamoSerialization(_) => "serialization_error",
            Error::Config(_) => "config_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether a batch-send layer should retry the call that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Queue(_) | Error::Inventory(_) | Error::Database(_) | Error::Storage(_)
        )
    }
}
