use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use deployer_core::config::parse_bool;
use deployer_core::state::ControllerStatus;
use deployer_core::types::ServiceRecord;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/auto-deploy/{enabled} — open or close the auto-deploy gate.
pub async fn set_auto_deploy(
    State(app): State<AppState>,
    Path(enabled): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let enabled = parse_bool(&enabled)
        .ok_or_else(|| AppError::bad_request(format!("not a boolean: '{enabled}'")))?;
    let enabled = app.controller.set_auto_deploy(enabled).await?;
    Ok(Json(serde_json::json!({
        "auto_deploy": enabled,
        "message": format!("Auto-deploy {}", if enabled { "enabled" } else { "disabled" }),
    })))
}

/// POST /api/poll-interval/{secs}
pub async fn set_poll_interval(
    State(app): State<AppState>,
    Path(secs): Path<u64>,
) -> Result<Json<serde_json::Value>, AppError> {
    if secs == 0 {
        return Err(AppError::bad_request("poll interval must be at least 1 second"));
    }
    let interval = app
        .controller
        .set_poll_interval(Duration::from_secs(secs))
        .await?;
    Ok(Json(serde_json::json!({
        "poll_interval_secs": interval.as_secs(),
        "message": format!("Poll interval set to {}s", interval.as_secs()),
    })))
}

/// GET /api/status
pub async fn get_status(State(app): State<AppState>) -> Result<Json<ControllerStatus>, AppError> {
    Ok(Json(app.controller.status()?))
}

/// GET /api/services — every service the controller has seen in the registry.
pub async fn list_services(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let services: Vec<ServiceRecord> = app.controller.services()?;
    Ok(Json(serde_json::json!({
        "total": services.len(),
        "services": services,
    })))
}
