use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Vector store schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embed(String),

    #[error("Vector store error: {0}")]
    Store(String),

    #[error("scan in progress")]
    AlreadyScanning,

    #[error("index is not ready")]
    NotReady,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for IndexError {
    fn into_response(self) -> Response {
        let status = match &self {
            IndexError::AlreadyScanning => StatusCode::CONFLICT,
            IndexError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            IndexError::NotFound(_) => StatusCode::NOT_FOUND,
            IndexError::BadRequest(_) | IndexError::Config(_) => StatusCode::BAD_REQUEST,
            IndexError::SchemaMismatch(_)
            | IndexError::Io(_)
            | IndexError::Embed(_)
            | IndexError::Store(_)
            | IndexError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type IndexResult<T> = Result<T, IndexError>;
