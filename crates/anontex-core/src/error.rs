//! Error taxonomy for the anonymizing proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum AnontexError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Mapping not found: {0}")]
    NotFound(String),

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Mapping store error: {0}")]
    MappingStore(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AnontexError>;

impl AnontexError {
    /// Client errors are logged as warnings, everything else as errors.
    pub fn is_client_error(&self) -> bool {
        matches!(self, AnontexError::Validation(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AnontexError::Validation(_) => StatusCode::BAD_REQUEST,
            AnontexError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnontexError::Validation(_) => "validation_error",
            AnontexError::NotFound(_) => "not_found_error",
            AnontexError::UpstreamTransport(_) => "upstream_transport_error",
            AnontexError::MappingStore(_) => "mapping_store_error",
            AnontexError::Detector(_) => "detector_error",
            AnontexError::Config(_) => "config_error",
            AnontexError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to hand back to the caller. Only validation errors echo
    /// their detail; the rest may carry store or transport internals.
    pub fn public_message(&self) -> String {
        match self {
            AnontexError::Validation(detail) => detail.clone(),
            AnontexError::NotFound(_) => {
                "Anonymization mapping expired or was already used".to_string()
            }
            AnontexError::UpstreamTransport(_) => "Failed to reach upstream API".to_string(),
            AnontexError::MappingStore(_) => "Anonymization mapping store unavailable".to_string(),
            AnontexError::Detector(_) => "PII detection failed".to_string(),
            AnontexError::Config(_) | AnontexError::Internal(_) => {
                "Internal Server Error".to_string()
            }
        }
    }
}

impl From<rusqlite::Error> for AnontexError {
    fn from(e: rusqlite::Error) -> Self {
        AnontexError::MappingStore(e.to_string())
    }
}

impl From<serde_json::Error> for AnontexError {
    fn from(e: serde_json::Error) -> Self {
        AnontexError::MappingStore(format!("mapping serialization: {}", e))
    }
}

impl From<reqwest::Error> for AnontexError {
    fn from(e: reqwest::Error) -> Self {
        AnontexError::UpstreamTransport(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AnontexError {
    fn from(e: tokio::task::JoinError) -> Self {
        AnontexError::Internal(format!("background task failed: {}", e))
    }
}

impl IntoResponse for AnontexError {
    fn into_response(self) -> Response {
        if self.is_client_error() {
            warn!("Rejecting request: {}", self);
        } else {
            error!("Request failed: {}", self);
        }

        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.public_message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
