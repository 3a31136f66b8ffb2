use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct DeploymentView {
    name: String,
    image: String,
    replicas: i32,
    ready: i32,
    status: &'static str,
}

/// GET /api/deployments — live view of the namespace.
///
/// A failed cluster query reads as an empty namespace.
pub async fn list_deployments(State(app): State<AppState>) -> Json<serde_json::Value> {
    let deployments = match app.cluster.get_deployments(&app.namespace).await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "deployment listing failed");
            Default::default()
        }
    };

    let views: Vec<DeploymentView> = deployments
        .iter()
        .map(|(name, info)| DeploymentView {
            name: name.clone(),
            image: info.image.clone(),
            replicas: info.desired_replicas,
            ready: info.ready_replicas,
            status: info.status(),
        })
        .collect();

    Json(serde_json::json!({
        "total": views.len(),
        "deployments": views,
    }))
}
