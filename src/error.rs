// Error taxonomy for the catalog engine and conversions for the HTTP surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

// Errors produced by the engine itself.
// Clone so that one coalesced fetch failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    // User-correctable; shown next to the offending field
    #[error("invalid {field} range: minimum {min} is greater than maximum {max}")]
    InvalidFilterRange {
        field: &'static str,
        min: i64,
        max: i64,
    },
    #[error("invalid {field} value {value:?}")]
    InvalidFilterValue { field: &'static str, value: String },
    #[error("fetching search results failed: {0}")]
    FetchFailed(String),
    #[error("inventory sync {0} is already in progress")]
    SyncAlreadyInProgress(String),
    #[error("inventory sync {id} failed: {reason}")]
    SyncFailed { id: String, reason: String },
    #[error("{0} not found")]
    NotFound(String),
}

// Errors raised by the upstream inventory collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum InventoryError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("could not decode upstream response: {0}")]
    Decode(String),
    #[error("inventory provider is not configured: {0}")]
    NotConfigured(&'static str),
}

impl InventoryError {
    // Worth another attempt: connection trouble, throttling or a server-side failure
    pub fn is_transient(&self) -> bool {
        match self {
            InventoryError::Transport(_) => true,
            InventoryError::Status { status, .. } => *status >= 500 || *status == 429,
            InventoryError::Decode(_) | InventoryError::NotConfigured(_) => false,
        }
    }
}

impl From<reqwest::Error> for InventoryError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            InventoryError::Status {
                status: status.as_u16(),
                url: error.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if error.is_decode() {
            InventoryError::Decode(error.to_string())
        } else {
            InventoryError::Transport(error.to_string())
        }
    }
}

// Application error type for the HTTP handlers
#[derive(Debug)]
pub enum AppError {
    InternalServerError(anyhow::Error),
    BadRequest(String),
    NotFound(String),
    BadGateway(String),
}

// Implement conversion from anyhow::Error for easier error propagation
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::InternalServerError(error)
    }
}

impl From<CatalogError> for AppError {
    fn from(error: CatalogError) -> Self {
        match error {
            CatalogError::InvalidFilterRange { .. } | CatalogError::InvalidFilterValue { .. } => {
                AppError::BadRequest(error.to_string())
            }
            CatalogError::NotFound(_) => AppError::NotFound(error.to_string()),
            CatalogError::FetchFailed(_) | CatalogError::SyncFailed { .. } => {
                AppError::BadGateway(error.to_string())
            }
            // Handlers answer this one as a notice; reaching here means a caller forgot to
            CatalogError::SyncAlreadyInProgress(_) => {
                AppError::InternalServerError(anyhow::Error::new(error))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InternalServerError(e) => {
                // Log the detailed error here, don't expose it to the client
                tracing::error!("Internal server error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
            AppError::BadRequest(message) => {
                tracing::debug!("Rejected request: {}", message);
                (StatusCode::BAD_REQUEST, message)
            }
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::BadGateway(message) => {
                tracing::warn!("Upstream failure: {}", message);
                (StatusCode::BAD_GATEWAY, message)
            }
        };

        (status, Json(json!({ "success": false, "error": error_message }))).into_response()
    }
}

// Define a custom Result type using our AppError
pub type AppResult<T> = Result<T, AppError>;
