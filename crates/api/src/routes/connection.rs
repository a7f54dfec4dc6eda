//! Connection Routes

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::SharedState;
use obd_session::DisconnectOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Connected,
    AlreadyConnected,
    Failed,
    Error,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub status: ConnectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Idempotent connect
pub async fn connect(State(state): State<SharedState>) -> Json<ConnectResponse> {
    // Run on its own task so a panicking adapter cannot take the handler down
    let task = tokio::spawn({
        let state = state.clone();
        async move { state.connections.connect().await }
    });

    let response = match task.await {
        Ok(outcome) if outcome.connected => ConnectResponse {
            status: if outcome.already_connected {
                ConnectStatus::AlreadyConnected
            } else {
                ConnectStatus::Connected
            },
            port: outcome.port,
            detail: None,
        },
        Ok(outcome) => ConnectResponse {
            status: ConnectStatus::Failed,
            port: None,
            detail: outcome.error,
        },
        Err(e) => {
            error!("Connect task failed: {}", e);
            ConnectResponse {
                status: ConnectStatus::Error,
                port: None,
                detail: Some(e.to_string()),
            }
        }
    };
    Json(response)
}

/// Stop polling, then close the handle
pub async fn disconnect(State(state): State<SharedState>) -> (StatusCode, Json<Value>) {
    match state.connections.disconnect().await {
        Ok(DisconnectOutcome::Disconnected) => {
            (StatusCode::OK, Json(json!({ "status": "disconnected" })))
        }
        Ok(DisconnectOutcome::NotConnected) => {
            (StatusCode::OK, Json(json!({ "status": "not_connected" })))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "detail": e.to_string() })),
        ),
    }
}

/// Liveness probe
pub async fn ping() -> Json<Value> {
    Json(json!({ "ok": true }))
}
