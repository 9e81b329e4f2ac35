use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use vanish_common::StoreError;

/// Erro de handler convertido em resposta HTTP com corpo `{"error": ...}`.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound,
    Internal(String),
    Store(StoreError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound => (StatusCode::NOT_FOUND, "não encontrado".into()),
            AppError::Internal(msg) => {
                error!(error = %msg, "erro interno");
                (StatusCode::INTERNAL_SERVER_ERROR, "erro interno".into())
            }
            AppError::Store(e) => {
                error!(error = %e, "erro no store");
                (StatusCode::INTERNAL_SERVER_ERROR, "erro interno".into())
            }
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AppError::NotFound,
            StoreError::InvalidArgument(msg) => AppError::BadRequest(msg),
            other => AppError::Store(other),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("task abortou: {e}"))
    }
}
