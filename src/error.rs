//! Error types shared across the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend not found in registry: {0}")]
    BackendNotFound(String),

    #[error("backend is already registered in the registry: {0}")]
    AlreadyRegistered(String),

    #[error("backend is not streamable: {0}")]
    NotStreamable(String),

    #[error("model not found in registry: {0}")]
    ModelNotFound(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("operation canceled")]
    Canceled,

    #[error("config error: {0}")]
    Config(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::BackendNotFound(_) => (StatusCode::NOT_FOUND, "backend_not_found"),
            Error::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
            Error::NotStreamable(_) => (StatusCode::NOT_IMPLEMENTED, "not_streamable"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            // Upstream failures (sidecar transport errors, decode failures,
            // subprocess exits) all surface as 500.
            Error::AlreadyRegistered(_)
            | Error::ServerNotFound(_)
            | Error::Execution(_)
            | Error::Canceled
            | Error::Config(_)
            | Error::Download(_)
            | Error::Http(_)
            | Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
