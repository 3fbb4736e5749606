use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::model::ModelKey;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("model directory not found: {}", .0.display())]
    ModelMissing(PathBuf),
    #[error("unsupported task: {0}")]
    UnsupportedTask(String),
    #[error("no model registered for {0}")]
    ModelUnavailable(ModelKey),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("upstream inference endpoint failed: {0}")]
    Upstream(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Upstream(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::BadRequest(_) | ServiceError::UnsupportedTask(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::ModelMissing(_) | ServiceError::ModelUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Tokenizer(_)
            | ServiceError::Inference(_)
            | ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
