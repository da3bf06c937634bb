//! Error types for warehouse operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Transient service error: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WarehouseError {
    /// Whether repeating the same call may succeed.
    ///
    /// Only throttling, server-side failures and connection problems qualify.
    /// Permission, validation and not-found errors are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            WarehouseError::Transient(_) => true,
            WarehouseError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WarehouseError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, WarehouseError>;
