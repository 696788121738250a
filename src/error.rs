//! Error taxonomy (SPEC_FULL.md §7). Component boundaries return a typed
//! `thiserror` enum; orchestration code upstream of them uses `anyhow` with
//! `.context(...)`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BookServiceError {
    #[error("websocket connect timed out after {0}ms")]
    ConnectTimeout(u64),
    #[error("rest fallback request failed: {0}")]
    RestRequest(#[from] reqwest::Error),
    #[error("token {0} is on the resolved-tokens set")]
    TokenResolved(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
    #[error("config section rejected: {0}")]
    InvalidSection(String),
}

/// Top-level error surfaced at the HTTP boundary; maps to a 4xx/5xx + JSON
/// body in `api::routes`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    BookService(#[from] BookServiceError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::BadRequest(_) | EngineError::Config(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Persistence(PersistenceError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Persistence(_) | EngineError::BookService(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
