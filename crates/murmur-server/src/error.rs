use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Upload not found: {0}")]
    UploadNotFound(Uuid),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::UploadNotFound(_) | ServerError::FileNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::MethodNotAllowed(_) => {
                (StatusCode::METHOD_NOT_ALLOWED, self.to_string())
            }
            ServerError::Storage(detail) => {
                tracing::error!(error = %detail, "Storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
