use axum::extract::State;
use axum::Json;
use deployer_core::HistoryPage;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/history — the most recent actions, newest first.
pub async fn get_history(State(app): State<AppState>) -> Result<Json<HistoryPage>, AppError> {
    let page = app.controller.history(app.history_limit)?;
    Ok(Json(page))
}
