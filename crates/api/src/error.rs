//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use obd_protocol::ObdError;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("not connected")]
    NotConnected,

    #[error("invalid trouble code '{0}'")]
    InvalidCode(String),

    #[error("{0}")]
    Source(#[from] ObdError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotConnected | ApiError::InvalidCode(_) => StatusCode::BAD_REQUEST,
            // Not a gateway status: clients must not repeat a full acquisition.
            ApiError::Source(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
