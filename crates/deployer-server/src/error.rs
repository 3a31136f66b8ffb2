use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use deployer_core::error::DeployError;

// ---------------------------------------------------------------------------
// Internal sentinels for explicit status codes
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 400 through the `anyhow::Error` chain.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

/// Carries an explicit HTTP 500 for a cluster action that ran and failed.
#[derive(Debug)]
struct ActionFailedError(String);

impl std::fmt::Display for ActionFailedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ActionFailedError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses. The body is always
/// `{"error": "<message>"}`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn action_failed(msg: impl Into<String>) -> Self {
        Self(ActionFailedError(msg.into()).into())
    }
}

fn status_for(e: &DeployError) -> StatusCode {
    match e {
        DeployError::InvalidServiceName(_) | DeployError::Config(_) => StatusCode::BAD_REQUEST,
        DeployError::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
        DeployError::NoPreviousRevision(_) => StatusCode::CONFLICT,
        DeployError::ControllerStopped => StatusCode::SERVICE_UNAVAILABLE,
        DeployError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DeployError::Registry(_) | DeployError::Cluster(_) | DeployError::Kube(_) => {
            StatusCode::BAD_GATEWAY
        }
        DeployError::CommandFailed { .. }
        | DeployError::SpawnFailed { .. }
        | DeployError::Manifest(_)
        | DeployError::PassFailed(_)
        | DeployError::Io(_)
        | DeployError::Yaml(_)
        | DeployError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<BadRequestError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if self.0.downcast_ref::<ActionFailedError>().is_some() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else if let Some(e) = self.0.downcast_ref::<DeployError>() {
            status_for(e)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        let response = AppError::bad_request("replicas must be >= 0").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn action_failure_maps_to_500() {
        let response = AppError::action_failed("apply failed").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn invalid_service_name_maps_to_400() {
        let err = AppError(DeployError::InvalidServiceName("Bad_Name".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn stopped_controller_maps_to_503() {
        let err = AppError(DeployError::ControllerStopped.into());
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn cluster_error_maps_to_502() {
        let err = AppError(DeployError::Cluster("connection refused".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn timeout_maps_to_504() {
        let err = AppError(
            DeployError::Timeout {
                operation: "apply".into(),
                seconds: 60,
            }
            .into(),
        );
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn unknown_error_maps_to_500() {
        let err = AppError(anyhow::anyhow!("boom"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
