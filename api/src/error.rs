use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::{FetchError, SourceAttempt};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no price source available for {token}")]
    NoSourceAvailable {
        token: String,
        attempts: Vec<SourceAttempt>,
    },
    #[error("invalid token id: {0}")]
    InvalidToken(String),
    #[error("price fetch aborted: {0}")]
    Aborted(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NoSourceAvailable { token, attempts } => {
                ApiError::NoSourceAvailable { token, attempts }
            }
            FetchError::Aborted { reason, .. } => ApiError::Aborted(reason),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NoSourceAvailable { .. } | ApiError::Aborted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::InvalidToken(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut body = json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        });
        if let ApiError::NoSourceAvailable { token, attempts } = &self {
            body["token"] = json!(token);
            body["attempts"] = json!(attempts);
        }
        (status, Json(body)).into_response()
    }
}
