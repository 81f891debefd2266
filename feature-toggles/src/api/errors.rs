use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::aggregator::MetricsError;
use crate::store::StoreError;
use crate::tokens::token_models::{InvalidTokenReason, TokenType};
use crate::toggles::constraint::DefinitionError;

/// Body of every error response.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub detail: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("no API token in request")]
    MissingToken,
    #[error("API token is not valid: {0}")]
    InvalidToken(#[from] InvalidTokenReason),
    #[error("API token is not known")]
    UnknownToken,
    #[error("{0} tokens cannot access this resource")]
    Forbidden(TokenType),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// (error type, short code, HTTP status) for this error.
    fn error_metadata(&self) -> (&'static str, &'static str, StatusCode) {
        match self {
            ApiError::MissingToken => ("authentication_error", "missing_token", StatusCode::UNAUTHORIZED),
            ApiError::InvalidToken(_) => ("authentication_error", "invalid_token", StatusCode::UNAUTHORIZED),
            ApiError::UnknownToken => ("authentication_error", "unknown_token", StatusCode::UNAUTHORIZED),
            ApiError::Forbidden(_) => ("authentication_error", "forbidden", StatusCode::FORBIDDEN),

            ApiError::RequestParsingError(_) => ("validation_error", "request_parsing_error", StatusCode::BAD_REQUEST),
            ApiError::BadRequest(_) => ("validation_error", "bad_request", StatusCode::BAD_REQUEST),
            ApiError::InvalidDefinition(_) => ("validation_error", "invalid_definition", StatusCode::BAD_REQUEST),

            ApiError::NotFound(_) => ("invalid_request", "not_found", StatusCode::NOT_FOUND),
            ApiError::Conflict(_) => ("invalid_request", "conflict", StatusCode::CONFLICT),

            ApiError::StoreUnavailable(_) => ("server_error", "store_unavailable", StatusCode::SERVICE_UNAVAILABLE),
            ApiError::Internal(_) => ("server_error", "internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    pub fn error_code(&self) -> &'static str {
        self.error_metadata().1
    }

    pub fn status_code(&self) -> StatusCode {
        self.error_metadata().2
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Conflict(what) => ApiError::Conflict(what),
            StoreError::ConnectionError(_)
            | StoreError::QueryError {
                error: sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_),
                ..
            } => ApiError::StoreUnavailable(error.to_string()),
            StoreError::QueryError { .. }
            | StoreError::MigrationError(_)
            | StoreError::Corrupted(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<MetricsError> for ApiError {
    fn from(error: MetricsError) -> Self {
        match error {
            MetricsError::InvalidWindow { .. } | MetricsError::InvalidHoursBack(_) => {
                ApiError::BadRequest(error.to_string())
            }
            MetricsError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (error_type, code, status) = self.error_metadata();

        let detail = if status.is_server_error() {
            tracing::error!(code, "request failed: {}", self);
            match self {
                ApiError::StoreUnavailable(_) => {
                    "The service is currently unavailable. Please try again later.".to_string()
                }
                _ => "An internal server error occurred.".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error_type: error_type.to_string(),
            code: code.to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}
