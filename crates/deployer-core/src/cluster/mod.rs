//! Cluster control-plane capability.
//!
//! The reconciler only sees [`ClusterClient`]; `kubectl` shells out to the
//! CLI and `kube_api` talks to the API server. Both scope every call to a
//! single namespace passed by the caller.

pub mod kube_api;
pub mod kubectl;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ClusterBackend, ControllerConfig};
use crate::error::Result;
use crate::manifest::ServiceManifest;
use crate::types::DeploymentInfo;

pub use kube_api::KubeClient;
pub use kubectl::KubectlClient;

/// Deployments keyed by name, ordered for stable output.
pub type DeploymentMap = BTreeMap<String, DeploymentInfo>;

/// Pod-template annotation that forces a rolling restart.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
/// Annotation the deployment controller stamps on each ReplicaSet revision.
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Every deployment in `namespace`. An `Err` means the query failed,
    /// which is distinct from an empty namespace.
    async fn get_deployments(&self, namespace: &str) -> Result<DeploymentMap>;

    /// Create-or-update the manifest. Returns the control plane's summary.
    async fn apply(&self, manifest: &ServiceManifest) -> Result<String>;

    /// Roll every pod of `name` by stamping the pod template.
    async fn rollout_restart(&self, namespace: &str, name: &str) -> Result<String>;

    /// Revert `name` to its previous revision.
    async fn rollout_undo(&self, namespace: &str, name: &str) -> Result<String>;

    /// Wait until the rollout of `name` converges. `Ok(false)` on timeout or
    /// when the rollout reports failure.
    async fn rollout_status(&self, namespace: &str, name: &str, timeout: Duration)
        -> Result<bool>;

    /// True when the control plane is usable.
    async fn ping(&self) -> bool;

    /// Short backend name for `/health`.
    fn backend(&self) -> &'static str;
}

/// Build the client selected by `cluster.backend`.
pub async fn connect(config: &ControllerConfig) -> Result<std::sync::Arc<dyn ClusterClient>> {
    match config.cluster.backend {
        ClusterBackend::Kubectl => Ok(std::sync::Arc::new(KubectlClient::from_config(config))),
        ClusterBackend::Kube => Ok(std::sync::Arc::new(KubeClient::try_default().await?)),
    }
}

/// Extract the tracked fields from a Deployment. Deployments without a name
/// or without containers are skipped.
pub fn deployment_info(
    deployment: &k8s_openapi::api::apps::v1::Deployment,
) -> Option<(String, DeploymentInfo)> {
    let name = deployment.metadata.name.clone()?;
    let spec = deployment.spec.as_ref()?;
    let container = spec.template.spec.as_ref()?.containers.first()?;
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    Some((
        name,
        DeploymentInfo {
            image: container.image.clone().unwrap_or_default(),
            desired_replicas: spec.replicas.unwrap_or(1),
            ready_replicas: ready,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestTemplate;

    #[test]
    fn deployment_info_defaults_missing_status() {
        let template = ManifestTemplate::from_config(&ControllerConfig::default());
        let manifest = template.render("orders", 2).unwrap();
        let (name, info) = deployment_info(&manifest.deployment).unwrap();
        assert_eq!(name, "orders");
        assert_eq!(info.image, "localhost:31500/orders:latest");
        assert_eq!(info.desired_replicas, 2);
        assert_eq!(info.ready_replicas, 0);
    }

    #[test]
    fn deployment_without_containers_is_skipped() {
        let deployment = k8s_openapi::api::apps::v1::Deployment::default();
        assert!(deployment_info(&deployment).is_none());
    }
}
