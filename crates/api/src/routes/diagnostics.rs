//! Diagnostic Routes

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{ApiError, SharedState};
use explain_gateway::ExplanationResult;
use fault_rules::{FaultRecord, FaultSet};
use obd_protocol::{QueryMode, SensorSnapshot};

/// Evaluate the fault rules against a freeze-frame read
pub async fn get_dtc(State(state): State<SharedState>) -> Result<Json<FaultSet>, ApiError> {
    let source = state.require_handle().await?;
    let frame = state.poller().poll_once(source.as_ref(), QueryMode::FreezeFrame).await?;
    let faults = fault_rules::evaluate(&frame);
    info!(faults = faults.len(), "Fault evaluation complete");
    Ok(Json(faults))
}

/// One-shot freeze-frame read
pub async fn get_freeze(
    State(state): State<SharedState>,
) -> Result<Json<SensorSnapshot>, ApiError> {
    let source = state.require_handle().await?;
    let frame = state.poller().poll_once(source.as_ref(), QueryMode::FreezeFrame).await?;
    Ok(Json(frame))
}

/// Clear stored trouble codes on the vehicle
pub async fn clear_codes(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let source = state.require_handle().await?;
    let result = match source.clear_codes().await {
        Ok(()) => {
            info!("Trouble codes cleared");
            "DTCs cleared successfully.".to_string()
        }
        Err(e) => {
            warn!("Clearing trouble codes failed: {}", e);
            format!("Failed to clear DTCs: {}", e)
        }
    };
    Ok(Json(json!({ "result": result })))
}

#[derive(Debug, Serialize)]
pub struct ExplainResponse {
    pub code: String,
    pub freeze_frame: SensorSnapshot,
    #[serde(flatten)]
    pub result: ExplanationResult,
}

/// Read the freeze frame and ask the gateway to explain `code` against it
pub async fn explain(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<ExplainResponse>, ApiError> {
    let code = code.trim().to_ascii_uppercase();
    if !FaultRecord::is_valid_code(&code) {
        return Err(ApiError::InvalidCode(code));
    }

    let source = state.require_handle().await?;
    let freeze_frame = state.poller().poll_once(source.as_ref(), QueryMode::FreezeFrame).await?;
    let result = state.gateway.explain(&code, &freeze_frame, None).await;

    Ok(Json(ExplainResponse {
        code,
        freeze_frame,
        result,
    }))
}
