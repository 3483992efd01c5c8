//! API error mapping
//!
//! Every engine error leaves the gateway as `{error, message}` JSON with a
//! status code derived from its kind.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use nekodrive_core::NekoError;
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] NekoError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Handler result
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => match e {
                NekoError::Conflict(_) => StatusCode::CONFLICT,
                NekoError::InvalidSequence { .. } | NekoError::InvalidRequest(_) => {
                    StatusCode::BAD_REQUEST
                }
                NekoError::IncompleteUpload { .. } | NekoError::Integrity(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                NekoError::SessionExpired(_) => StatusCode::GONE,
                NekoError::NotFound(_) => StatusCode::NOT_FOUND,
                NekoError::ShardUnavailable { .. } | NekoError::Transient { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "InvalidRequestError",
            ApiError::Engine(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        counter!("api_errors_total", "code" => code).increment(1);

        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        } else {
            tracing::debug!(error = %self, code, "Request rejected");
        }

        let mut body = json!({
            "error": code,
            "message": self.to_string(),
        });
        if let ApiError::Engine(NekoError::IncompleteUpload { missing }) = &self {
            body["missing"] = json!(missing);
        }

        (status, Json(body)).into_response()
    }
}
