use std::sync::Arc;
use std::time::Duration;

use crate::cluster::ClusterClient;

/// Blocks on a deployment's rollout until it converges or the timeout elapses.
pub struct HealthValidator {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
}

impl HealthValidator {
    pub fn new(cluster: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    /// True only when the rollout reported success within `timeout`.
    /// Query errors count as unhealthy.
    pub async fn wait_healthy(&self, service: &str, timeout: Duration) -> bool {
        match self
            .cluster
            .rollout_status(&self.namespace, service, timeout)
            .await
        {
            Ok(true) => {
                tracing::info!(service, "rollout healthy");
                true
            }
            Ok(false) => {
                tracing::warn!(service, timeout_secs = timeout.as_secs(), "rollout not healthy");
                false
            }
            Err(e) => {
                tracing::error!(service, error = %e, "rollout status check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ClusterCall, FakeCluster};

    #[tokio::test]
    async fn converged_rollout_is_healthy() {
        let cluster = Arc::new(FakeCluster::new());
        let validator = HealthValidator::new(cluster.clone(), "holm");
        assert!(validator.wait_healthy("orders", Duration::from_secs(1)).await);
        assert_eq!(cluster.calls(), vec![ClusterCall::Status("orders".into())]);
    }

    #[tokio::test]
    async fn stuck_rollout_is_unhealthy() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.set_unhealthy("orders");
        let validator = HealthValidator::new(cluster, "holm");
        assert!(!validator.wait_healthy("orders", Duration::from_secs(1)).await);
    }
}
