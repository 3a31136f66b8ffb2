use axum::extract::{Path, State};
use axum::Json;
use deployer_core::reconciler::PassReport;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct DeployBody {
    image: String,
    #[serde(default = "default_replicas")]
    replicas: i32,
}

fn default_replicas() -> i32 {
    1
}

/// POST /api/deploy — deploy an image now, regardless of the auto-deploy gate.
///
/// A `holm/` prefix on `image` is dropped to get the service name.
pub async fn deploy(
    State(app): State<AppState>,
    Json(body): Json<DeployBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let image = body.image.trim();
    if image.is_empty() {
        return Err(AppError::bad_request("image is required"));
    }
    if body.replicas < 0 {
        return Err(AppError::bad_request("replicas must be >= 0"));
    }

    let outcome = app.controller.deploy(image, body.replicas).await?;
    if !outcome.success {
        return Err(AppError::action_failed(outcome.message));
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Deployed {}", outcome.service),
        "service": outcome.service,
    })))
}

/// POST /api/rollback/{name}
pub async fn rollback(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = app.controller.rollback(name).await?;
    if !outcome.success {
        return Err(AppError::action_failed(outcome.message));
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Rolled back {}", outcome.service),
        "service": outcome.service,
    })))
}

/// POST /api/reconcile — run a pass now instead of waiting for the next tick.
pub async fn reconcile(State(app): State<AppState>) -> Result<Json<PassReport>, AppError> {
    let report = app.controller.reconcile_now().await?;
    Ok(Json(report))
}
