//! In-memory stand-ins for the registry and the cluster.
//!
//! Compiled for unit tests and, through the `testkit` feature, for the
//! server's integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::{ClusterClient, DeploymentMap};
use crate::error::{DeployError, Result};
use crate::manifest::ServiceManifest;
use crate::registry::ImageRegistry;
use crate::types::DeploymentInfo;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// FakeRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeRegistry {
    repositories: Mutex<Vec<String>>,
    tags: Mutex<HashMap<String, Vec<String>>>,
    digests: Mutex<HashMap<(String, String), String>>,
    unreachable: Mutex<bool>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repositories(repos: &[&str]) -> Self {
        let registry = Self::new();
        registry.set_repositories(repos);
        registry
    }

    pub fn set_repositories(&self, repos: &[&str]) {
        *lock(&self.repositories) = repos.iter().map(|r| r.to_string()).collect();
    }

    pub fn set_tags(&self, repo: &str, tags: &[&str]) {
        lock(&self.tags).insert(repo.to_string(), tags.iter().map(|t| t.to_string()).collect());
    }

    /// Set the digest of `repo:latest`.
    pub fn set_digest(&self, repo: &str, digest: &str) {
        lock(&self.digests).insert((repo.to_string(), "latest".to_string()), digest.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *lock(&self.unreachable) = unreachable;
    }

    fn down(&self) -> bool {
        *lock(&self.unreachable)
    }
}

#[async_trait]
impl ImageRegistry for FakeRegistry {
    async fn list_repositories(&self) -> Vec<String> {
        if self.down() {
            return Vec::new();
        }
        lock(&self.repositories).clone()
    }

    async fn get_tags(&self, repository: &str) -> Vec<String> {
        if self.down() {
            return Vec::new();
        }
        lock(&self.tags).get(repository).cloned().unwrap_or_default()
    }

    async fn get_digest(&self, repository: &str, tag: &str) -> Option<String> {
        if self.down() {
            return None;
        }
        lock(&self.digests)
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
    }

    async fn ping(&self) -> bool {
        !self.down()
    }
}

// ---------------------------------------------------------------------------
// FakeCluster
// ---------------------------------------------------------------------------

/// A mutating or blocking call observed by [`FakeCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Apply(String, i32),
    Restart(String),
    Undo(String),
    Status(String),
}

#[derive(Default)]
pub struct FakeCluster {
    deployments: Mutex<DeploymentMap>,
    query_error: Mutex<Option<String>>,
    apply_failures: Mutex<HashMap<String, String>>,
    restart_failures: Mutex<HashMap<String, String>>,
    undo_failures: Mutex<HashMap<String, String>>,
    unhealthy: Mutex<HashSet<String>>,
    calls: Mutex<Vec<ClusterCall>>,
    action_delay: Mutex<Duration>,
    unreachable: Mutex<bool>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a ready deployment running `image`.
    pub fn add_deployment(&self, name: &str, image: &str, replicas: i32) {
        lock(&self.deployments).insert(
            name.to_string(),
            DeploymentInfo {
                image: image.to_string(),
                desired_replicas: replicas,
                ready_replicas: replicas,
            },
        );
    }

    /// Make `get_deployments` fail until cleared with `None`.
    pub fn set_query_error(&self, error: Option<&str>) {
        *lock(&self.query_error) = error.map(str::to_string);
    }

    pub fn fail_apply(&self, name: &str, message: &str) {
        lock(&self.apply_failures).insert(name.to_string(), message.to_string());
    }

    pub fn fail_restart(&self, name: &str, message: &str) {
        lock(&self.restart_failures).insert(name.to_string(), message.to_string());
    }

    pub fn fail_undo(&self, name: &str, message: &str) {
        lock(&self.undo_failures).insert(name.to_string(), message.to_string());
    }

    /// Rollouts of `name` never converge.
    pub fn set_unhealthy(&self, name: &str) {
        lock(&self.unhealthy).insert(name.to_string());
    }

    pub fn set_healthy(&self, name: &str) {
        lock(&self.unhealthy).remove(name);
    }

    /// Delay applied to every apply / restart / undo call.
    pub fn set_action_delay(&self, delay: Duration) {
        *lock(&self.action_delay) = delay;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *lock(&self.unreachable) = unreachable;
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        lock(&self.calls).clone()
    }

    fn push(&self, call: ClusterCall) {
        lock(&self.calls).push(call);
    }

    async fn delay(&self) {
        let delay = *lock(&self.action_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn failure(map: &Mutex<HashMap<String, String>>, command: &str, name: &str) -> Result<()> {
        match lock(map).get(name) {
            Some(stderr) => Err(DeployError::CommandFailed {
                command: format!("{command} {name}"),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_deployments(&self, _namespace: &str) -> Result<DeploymentMap> {
        if let Some(e) = lock(&self.query_error).clone() {
            return Err(DeployError::Cluster(e));
        }
        Ok(lock(&self.deployments).clone())
    }

    async fn apply(&self, manifest: &ServiceManifest) -> Result<String> {
        let summary = manifest.summary();
        self.push(ClusterCall::Apply(summary.name.clone(), summary.replicas));
        self.delay().await;
        Self::failure(&self.apply_failures, "apply", &summary.name)?;
        lock(&self.deployments).insert(
            summary.name.clone(),
            DeploymentInfo {
                image: summary.image.unwrap_or_default(),
                desired_replicas: summary.replicas,
                ready_replicas: summary.replicas,
            },
        );
        Ok(format!("deployment.apps/{} configured", summary.name))
    }

    async fn rollout_restart(&self, _namespace: &str, name: &str) -> Result<String> {
        self.push(ClusterCall::Restart(name.to_string()));
        self.delay().await;
        Self::failure(&self.restart_failures, "rollout restart", name)?;
        Ok(format!("deployment.apps/{name} restarted"))
    }

    async fn rollout_undo(&self, _namespace: &str, name: &str) -> Result<String> {
        self.push(ClusterCall::Undo(name.to_string()));
        self.delay().await;
        Self::failure(&self.undo_failures, "rollout undo", name)?;
        Ok(format!("deployment.apps/{name} rolled back"))
    }

    async fn rollout_status(
        &self,
        _namespace: &str,
        name: &str,
        _timeout: Duration,
    ) -> Result<bool> {
        self.push(ClusterCall::Status(name.to_string()));
        Ok(!lock(&self.unhealthy).contains(name))
    }

    async fn ping(&self) -> bool {
        !*lock(&self.unreachable)
    }

    fn backend(&self) -> &'static str {
        "fake"
    }
}
