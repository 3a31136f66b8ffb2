pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health))
        // Events (SSE)
        .route("/api/events", get(routes::events::sse_events))
        // Cluster
        .route(
            "/api/deployments",
            get(routes::deployments::list_deployments),
        )
        // Registry
        .route("/api/images", get(routes::images::list_images))
        .route("/api/pending", get(routes::images::list_pending))
        // Actions
        .route("/api/deploy", post(routes::actions::deploy))
        .route("/api/rollback/{name}", post(routes::actions::rollback))
        .route("/api/reconcile", post(routes::actions::reconcile))
        // Controller
        .route("/api/history", get(routes::history::get_history))
        .route("/api/status", get(routes::controller::get_status))
        .route("/api/services", get(routes::controller::list_services))
        .route(
            "/api/auto-deploy/{enabled}",
            post(routes::controller::set_auto_deploy),
        )
        .route(
            "/api/poll-interval/{secs}",
            post(routes::controller::set_poll_interval),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the API server on `0.0.0.0:{port}`.
pub async fn serve(app_state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(app_state, listener).await
}

/// Start the API server on a pre-bound listener.
///
/// Lets the caller read the actual port before starting (useful when
/// `port = 0` and the OS picks a free port).
pub async fn serve_on(
    app_state: AppState,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(app_state);

    tracing::info!("deploy controller listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
