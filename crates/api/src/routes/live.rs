//! Live Data Routes

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{ApiError, SharedState};
use obd_session::StartOutcome;

/// Start the polling session; a running session is left alone
pub async fn start(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let source = state.require_handle().await?;
    if state.poller().start(source, state.poll_interval) == StartOutcome::AlreadyRunning {
        debug!("Live polling already running");
    }
    Ok(Json(json!({ "status": "started" })))
}

/// Request the polling session to stop; returns immediately
pub async fn stop(State(state): State<SharedState>) -> Json<Value> {
    state.poller().stop();
    Json(json!({ "status": "stopped" }))
}

/// Latest published snapshot, or an empty mapping before the first poll
pub async fn data(State(state): State<SharedState>) -> Json<BTreeMap<String, String>> {
    Json(
        state
            .poller()
            .get_latest()
            .map(|snapshot| snapshot.to_raw_map())
            .unwrap_or_default(),
    )
}
