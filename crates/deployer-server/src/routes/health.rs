use axum::extract::State;
use axum::Json;
use chrono::Utc;

use crate::state::AppState;

/// GET /health — liveness plus registry and cluster reachability.
///
/// Always 200; `status` is `degraded` when either dependency is unreachable.
pub async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    let (registry_ok, cluster_ok) = tokio::join!(app.registry.ping(), app.cluster.ping());
    let controller = app.controller.status().ok();

    Json(serde_json::json!({
        "status": if registry_ok && cluster_ok { "healthy" } else { "degraded" },
        "registry": if registry_ok { "connected" } else { "disconnected" },
        "kubectl": if cluster_ok { "available" } else { "unavailable" },
        "backend": app.cluster.backend(),
        "auto_deploy": controller.as_ref().map(|s| s.auto_deploy),
        "last_check": controller.and_then(|s| s.last_check),
        "timestamp": Utc::now(),
    }))
}
