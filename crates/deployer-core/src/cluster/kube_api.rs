//! `ClusterClient` that talks to the API server through `kube`.
//!
//! Mirrors what `kubectl` does client-side: server-side apply for manifests,
//! a `restartedAt` annotation for restarts, ReplicaSet revision lookup for
//! undo, and polling of the deployment status for rollout convergence.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;

use super::{
    deployment_info, ClusterClient, DeploymentMap, RESTARTED_AT_ANNOTATION, REVISION_ANNOTATION,
};
use crate::error::{DeployError, Result};
use crate::manifest::ServiceManifest;

const FIELD_MANAGER: &str = "deploy-controller";
const POD_TEMPLATE_HASH: &str = "pod-template-hash";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct KubeClient {
    client: Client,
    poll_interval: Duration,
}

/// Convergence state of a deployment rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutState {
    Complete,
    Progressing(String),
    Failed(String),
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Connect using the in-cluster service account or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn manifest_namespace(manifest: &ServiceManifest) -> Result<&str> {
    manifest
        .deployment
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| DeployError::Manifest("deployment has no namespace".to_string()))
}

/// Classify a deployment the same way `kubectl rollout status` does.
pub fn rollout_state(deployment: &Deployment) -> RolloutState {
    let Some(status) = deployment.status.as_ref() else {
        return RolloutState::Progressing("no status reported yet".to_string());
    };
    let generation = deployment.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return RolloutState::Progressing("waiting for spec update to be observed".to_string());
    }
    let deadline_exceeded = status.conditions.iter().flatten().any(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if deadline_exceeded {
        return RolloutState::Failed("progress deadline exceeded".to_string());
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if updated < desired {
        RolloutState::Progressing(format!("{updated} of {desired} new replicas updated"))
    } else if total > updated {
        RolloutState::Progressing(format!("{} old replicas pending termination", total - updated))
    } else if available < updated {
        RolloutState::Progressing(format!("{available} of {updated} updated replicas available"))
    } else {
        RolloutState::Complete
    }
}

fn revision_of(rs: &ReplicaSet) -> Option<u64> {
    rs.metadata
        .annotations
        .as_ref()?
        .get(REVISION_ANNOTATION)?
        .parse()
        .ok()
}

/// The ReplicaSet holding the revision just before the newest one.
pub fn previous_revision(replica_sets: &[ReplicaSet]) -> Option<&ReplicaSet> {
    let mut revisions: Vec<(u64, &ReplicaSet)> = replica_sets
        .iter()
        .filter_map(|rs| revision_of(rs).map(|r| (r, rs)))
        .collect();
    revisions.sort_by_key(|(r, _)| *r);
    revisions.pop()?;
    revisions.pop().map(|(_, rs)| rs)
}

fn owned_by(rs: &ReplicaSet, uid: &str) -> bool {
    rs.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.uid == uid)
}

fn label_selector(deployment: &Deployment) -> Option<String> {
    let labels = deployment.spec.as_ref()?.selector.match_labels.as_ref()?;
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get_deployments(&self, namespace: &str) -> Result<DeploymentMap> {
        let list = self
            .deployments(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| DeployError::Cluster(e.to_string()))?;
        Ok(list.items.iter().filter_map(deployment_info).collect())
    }

    async fn apply(&self, manifest: &ServiceManifest) -> Result<String> {
        let namespace = manifest_namespace(manifest)?;
        let name = manifest.name();
        let params = PatchParams::apply(FIELD_MANAGER).force();

        self.deployments(namespace)
            .patch(name, &params, &Patch::Apply(&manifest.deployment))
            .await?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        services
            .patch(name, &params, &Patch::Apply(&manifest.service))
            .await?;

        Ok(format!(
            "deployment.apps/{name} serverside-applied\nservice/{name} serverside-applied"
        ))
    }

    async fn rollout_restart(&self, namespace: &str, name: &str) -> Result<String> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(
            RESTARTED_AT_ANNOTATION.to_string(),
            chrono::Utc::now().to_rfc3339().into(),
        );
        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "annotations": annotations } } }
        });
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(format!("deployment.apps/{name} restarted"))
    }

    async fn rollout_undo(&self, namespace: &str, name: &str) -> Result<String> {
        let api = self.deployments(namespace);
        let mut deployment = api.get(name).await?;
        let uid = deployment
            .metadata
            .uid
            .clone()
            .ok_or_else(|| DeployError::DeploymentNotFound(name.to_string()))?;
        let selector = label_selector(&deployment)
            .ok_or_else(|| DeployError::Manifest(format!("{name} has no label selector")))?;

        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let owned: Vec<ReplicaSet> = replica_sets
            .list(&ListParams::default().labels(&selector))
            .await?
            .items
            .into_iter()
            .filter(|rs| owned_by(rs, &uid))
            .collect();

        let previous = previous_revision(&owned)
            .ok_or_else(|| DeployError::NoPreviousRevision(name.to_string()))?;
        let mut template = previous
            .spec
            .as_ref()
            .and_then(|s| s.template.clone())
            .ok_or_else(|| DeployError::Manifest(format!("{name}: revision has no template")))?;
        if let Some(labels) = template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
            labels.remove(POD_TEMPLATE_HASH);
        }

        let spec = deployment
            .spec
            .as_mut()
            .ok_or_else(|| DeployError::Manifest(format!("{name} has no spec")))?;
        spec.template = template;
        api.replace(name, &PostParams::default(), &deployment).await?;

        let revision = revision_of(previous).unwrap_or_default();
        Ok(format!("deployment.apps/{name} rolled back to revision {revision}"))
    }

    async fn rollout_status(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let api = self.deployments(namespace);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let deployment = api.get(name).await?;
            match rollout_state(&deployment) {
                RolloutState::Complete => return Ok(true),
                RolloutState::Failed(reason) => {
                    tracing::warn!(deployment = name, reason = %reason, "rollout failed");
                    return Ok(false);
                }
                RolloutState::Progressing(progress) => {
                    tracing::debug!(deployment = name, progress = %progress, "rollout in progress");
                }
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ping(&self) -> bool {
        self.client.apiserver_version().await.is_ok()
    }

    fn backend(&self) -> &'static str {
        "kube"
    }
}
