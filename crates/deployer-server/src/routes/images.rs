use axum::extract::State;
use axum::Json;
use deployer_core::types::RegistryImage;
use serde::Serialize;

use crate::state::AppState;

/// GET /api/images — every repository with its tags.
pub async fn list_images(State(app): State<AppState>) -> Json<serde_json::Value> {
    let repositories = app.registry.list_repositories().await;
    let images: Vec<RegistryImage> =
        futures::future::join_all(repositories.into_iter().map(|repository| {
            let registry = app.registry.clone();
            async move {
                let tags = registry.get_tags(&repository).await;
                RegistryImage { repository, tags }
            }
        }))
        .await;

    Json(serde_json::json!({
        "total": images.len(),
        "images": images,
    }))
}

#[derive(Serialize)]
struct PendingView {
    image: String,
    service: String,
}

/// GET /api/pending — repositories with no deployment of the same name.
pub async fn list_pending(State(app): State<AppState>) -> Json<serde_json::Value> {
    let (repositories, deployments) = tokio::join!(
        app.registry.list_repositories(),
        app.cluster.get_deployments(&app.namespace)
    );
    let deployments = deployments.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "deployment listing failed");
        Default::default()
    });

    let pending: Vec<PendingView> = repositories
        .into_iter()
        .filter(|repo| !deployments.contains_key(repo))
        .map(|repo| PendingView {
            service: repo.clone(),
            image: repo,
        })
        .collect();

    Json(serde_json::json!({
        "total": pending.len(),
        "pending": pending,
    }))
}
