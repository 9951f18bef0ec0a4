//! Sync error types.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// HTTP outcomes are not errors at this level: the API client folds them into
/// [`ApiResponse`](crate::types::ApiResponse). What remains are local failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] caixa_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sync operation not found: {0}")]
    OperationNotFound(String),

    #[error("invalid sync payload: {0}")]
    InvalidPayload(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
