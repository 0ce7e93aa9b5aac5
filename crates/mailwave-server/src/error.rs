use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use mailwave_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid API token")]
    Unauthorized,

    #[error("Insufficient credits")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) | ServerError::Store(StoreError::NotFound) => {
                StatusCode::NOT_FOUND
            }
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Store(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ServerError::InsufficientCredits {
                required,
                available,
            } => serde_json::json!({
                "error": self.to_string(),
                "required": required,
                "available": available,
                "shortfall": required - available,
            }),
            ServerError::Store(StoreError::NotFound) => {
                serde_json::json!({ "error": "Record not found" })
            }
            ServerError::Store(e) => {
                tracing::error!(error = %e, "Storage failure while handling request");
                serde_json::json!({ "error": "Internal server error" })
            }
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "Internal failure while handling request");
                serde_json::json!({ "error": "Internal server error" })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        };

        (status, axum::Json(body)).into_response()
    }
}
