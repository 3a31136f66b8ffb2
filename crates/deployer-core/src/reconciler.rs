//! One reconciliation pass: diff the registry against the cluster and the
//! cached digests, then deploy, restart and roll back as needed.
//!
//! Per service the pass walks one of these paths:
//!
//! ```text
//! UNCHANGED       -> (nothing)
//! MISSING         -> DEPLOY  -> healthy | unhealthy -> ROLLBACK
//! DIGEST_CHANGED  -> RESTART -> healthy | unhealthy -> ROLLBACK
//! ```
//!
//! Services are handled one at a time in registry order. Nothing in a pass
//! is fatal: unreachable dependencies degrade to empty results and failed
//! actions are recorded before moving on to the next service.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterClient, DeploymentMap};
use crate::config::{ClusterFailurePolicy, ControllerConfig, DigestPolicy};
use crate::executor::{ActionExecutor, ActionOutcome};
use crate::health::HealthValidator;
use crate::manifest::ManifestTemplate;
use crate::registry::ImageRegistry;
use crate::state::ControllerState;
use crate::types::{service_name_for_image, ActionKind, Trigger};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// What happened to one service during a pass. Unchanged services are not
/// reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOutcome {
    pub service: String,
    pub action: ActionKind,
    pub success: bool,
    /// `None` when the action itself failed and no health check ran.
    pub healthy: Option<bool>,
    /// `Some(success)` when a rollback was attempted.
    pub rolled_back: Option<bool>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    /// The gate was off; only the cluster snapshot was refreshed.
    pub gated: bool,
    /// Mutating actions were skipped because the deployment query failed.
    pub suppressed: bool,
    pub cluster_error: Option<String>,
    pub repositories: usize,
    pub outcomes: Vec<ServiceOutcome>,
}

impl PassReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            gated: false,
            suppressed: false,
            cluster_error: None,
            repositories: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn count(&self, action: ActionKind) -> usize {
        self.outcomes.iter().filter(|o| o.action == action).count()
    }

    pub fn rollbacks(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.rolled_back.is_some())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

enum Plan {
    Unchanged,
    Deploy,
    Restart,
}

pub struct Reconciler {
    registry: Arc<dyn ImageRegistry>,
    cluster: Arc<dyn ClusterClient>,
    executor: ActionExecutor,
    health: HealthValidator,
    tag: String,
    health_timeout: Duration,
    default_replicas: i32,
    digest_policy: DigestPolicy,
    cluster_failure: ClusterFailurePolicy,
}

impl Reconciler {
    pub fn new(
        config: &ControllerConfig,
        registry: Arc<dyn ImageRegistry>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let template = ManifestTemplate::from_config(config);
        let namespace = template.namespace.clone();
        Self {
            executor: ActionExecutor::new(
                Arc::clone(&cluster),
                template,
                config.action_timeout(),
            ),
            health: HealthValidator::new(Arc::clone(&cluster), namespace),
            registry,
            cluster,
            tag: config.registry.tag.clone(),
            health_timeout: config.health_timeout(),
            default_replicas: config.default_replicas,
            digest_policy: config.digest_policy,
            cluster_failure: config.cluster_failure,
        }
    }

    pub fn namespace(&self) -> &str {
        self.executor.namespace()
    }

    /// Run one full pass against `state`.
    pub async fn run_pass(&self, state: &mut ControllerState) -> PassReport {
        let mut report = PassReport::new();

        if !state.auto_deploy_enabled {
            report.gated = true;
            match self.cluster.get_deployments(self.namespace()).await {
                Ok(deployments) => state.refresh_snapshot(deployments),
                Err(e) => {
                    tracing::warn!(error = %e, "cluster snapshot refresh failed");
                    report.cluster_error = Some(e.to_string());
                }
            }
            state.last_check = Some(Utc::now());
            return report;
        }

        let repositories = dedup(self.registry.list_repositories().await);
        report.repositories = repositories.len();
        tracing::info!(count = repositories.len(), "checking registry for new images");

        let deployments = match self.cluster.get_deployments(self.namespace()).await {
            Ok(deployments) => {
                state.refresh_snapshot(deployments.clone());
                deployments
            }
            Err(e) => {
                tracing::error!(error = %e, "cluster query failed");
                report.cluster_error = Some(e.to_string());
                match self.cluster_failure {
                    ClusterFailurePolicy::Suppress => {
                        report.suppressed = true;
                        state.last_check = Some(Utc::now());
                        return report;
                    }
                    ClusterFailurePolicy::TreatAsEmpty => DeploymentMap::new(),
                }
            }
        };

        for repo in &repositories {
            let outcome = self.reconcile_service(state, &deployments, repo).await;
            if let Some(outcome) = outcome {
                report.outcomes.push(outcome);
            }
        }

        state.last_check = Some(Utc::now());
        tracing::info!(
            deploys = report.count(ActionKind::Deploy),
            restarts = report.count(ActionKind::Restart),
            rollbacks = report.rollbacks(),
            "pass complete"
        );
        report
    }

    async fn reconcile_service(
        &self,
        state: &mut ControllerState,
        deployments: &DeploymentMap,
        service: &str,
    ) -> Option<ServiceOutcome> {
        let digest = self.registry.get_digest(service, &self.tag).await;
        let record = state.service_mut(service);
        if let Some(info) = deployments.get(service) {
            record.observe(info);
        }

        let plan = if !deployments.contains_key(service) {
            Plan::Deploy
        } else {
            match (digest.as_deref(), record.last_known_digest.as_deref()) {
                (Some(current), Some(stored)) if current != stored => Plan::Restart,
                _ => Plan::Unchanged,
            }
        };

        let outcome = match plan {
            Plan::Unchanged => None,
            Plan::Deploy => {
                tracing::info!(service, "new service detected");
                let result = self
                    .executor
                    .deploy(&mut state.history, service, self.default_replicas, Trigger::Auto)
                    .await;
                Some(self.verify(state, service, ActionKind::Deploy, result).await)
            }
            Plan::Restart => {
                tracing::info!(service, "image digest changed");
                let result = self
                    .executor
                    .restart(&mut state.history, service, Trigger::Auto)
                    .await;
                Some(self.verify(state, service, ActionKind::Restart, result).await)
            }
        };

        let advance = match self.digest_policy {
            DigestPolicy::Always => true,
            DigestPolicy::OnSuccess => outcome
                .as_ref()
                .map_or(true, |o| o.success && o.healthy == Some(true)),
        };
        if advance {
            if let Some(d) = digest {
                state.service_mut(service).last_known_digest = Some(d);
            }
        }
        outcome
    }

    /// Health-check a successful action and roll back once if it does not
    /// converge.
    async fn verify(
        &self,
        state: &mut ControllerState,
        service: &str,
        action: ActionKind,
        result: ActionOutcome,
    ) -> ServiceOutcome {
        let mut outcome = ServiceOutcome {
            service: service.to_string(),
            action,
            success: result.success,
            healthy: None,
            rolled_back: None,
            message: result.message,
        };
        if !result.success || !action.needs_health_check() {
            return outcome;
        }

        let healthy = self.health.wait_healthy(service, self.health_timeout).await;
        outcome.healthy = Some(healthy);
        if !healthy {
            tracing::warn!(service, %action, "not healthy, rolling back");
            let rollback = self
                .executor
                .rollback(&mut state.history, service, Trigger::Auto)
                .await;
            outcome.rolled_back = Some(rollback.success);
        }
        outcome
    }

    /// Operator-requested deploy. Bypasses the gate and the health check.
    /// `image` may carry the `holm/` registry prefix.
    pub async fn deploy_manual(
        &self,
        state: &mut ControllerState,
        image: &str,
        replicas: i32,
    ) -> (String, ActionOutcome) {
        let service = service_name_for_image(image).to_string();
        let outcome = self
            .executor
            .deploy(&mut state.history, &service, replicas, Trigger::Manual)
            .await;
        (service, outcome)
    }

    pub async fn rollback_manual(&self, state: &mut ControllerState, service: &str) -> ActionOutcome {
        self.executor
            .rollback(&mut state.history, service, Trigger::Manual)
            .await
    }
}

/// Drop repeated repository names, keeping first-seen order.
fn dedup(repositories: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    repositories
        .into_iter()
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ClusterCall, FakeCluster, FakeRegistry};

    struct Fixture {
        registry: Arc<FakeRegistry>,
        cluster: Arc<FakeCluster>,
        reconciler: Reconciler,
        state: ControllerState,
    }

    fn fixture_with(config: ControllerConfig) -> Fixture {
        let registry = Arc::new(FakeRegistry::new());
        let cluster = Arc::new(FakeCluster::new());
        let reconciler = Reconciler::new(&config, registry.clone(), cluster.clone());
        let state = ControllerState::new(&config);
        Fixture {
            registry,
            cluster,
            reconciler,
            state,
        }
    }

    fn fixture() -> Fixture {
        let mut config = ControllerConfig::default();
        config.auto_deploy_enabled = true;
        config.health_timeout_secs = 1;
        fixture_with(config)
    }

    fn actions(state: &ControllerState, action: ActionKind) -> usize {
        state
            .history
            .records()
            .filter(|r| r.action == action)
            .count()
    }

    #[tokio::test]
    async fn missing_repository_is_deployed_once() {
        let mut f = fixture();
        f.registry.set_repositories(&["alpha", "beta"]);
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);

        let report = f.reconciler.run_pass(&mut f.state).await;

        assert_eq!(report.count(ActionKind::Deploy), 1);
        assert_eq!(report.outcomes[0].service, "beta");
        assert_eq!(report.outcomes[0].healthy, Some(true));
        assert_eq!(actions(&f.state, ActionKind::Deploy), 1);
        assert_eq!(actions(&f.state, ActionKind::Restart), 0);
        assert_eq!(actions(&f.state, ActionKind::Rollback), 0);
        assert!(f
            .cluster
            .calls()
            .iter()
            .all(|c| !matches!(c, ClusterCall::Apply(name, _) if name == "alpha")));
    }

    #[tokio::test]
    async fn deployed_service_is_not_deployed_again() {
        let mut f = fixture();
        f.registry.set_repositories(&["beta"]);

        f.reconciler.run_pass(&mut f.state).await;
        f.reconciler.run_pass(&mut f.state).await;
        f.reconciler.run_pass(&mut f.state).await;

        assert_eq!(actions(&f.state, ActionKind::Deploy), 1);
        assert_eq!(f.state.history.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_repository_names_deploy_once() {
        let mut f = fixture();
        f.registry.set_repositories(&["beta", "beta"]);

        let report = f.reconciler.run_pass(&mut f.state).await;

        assert_eq!(report.repositories, 1);
        assert_eq!(actions(&f.state, ActionKind::Deploy), 1);
    }

    #[tokio::test]
    async fn unchanged_digest_does_not_restart() {
        let mut f = fixture();
        f.registry.set_repositories(&["alpha"]);
        f.registry.set_digest("alpha", "sha256:d1");
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);

        f.reconciler.run_pass(&mut f.state).await;
        f.reconciler.run_pass(&mut f.state).await;

        assert!(f.state.history.is_empty());
        assert_eq!(f.state.digest_of("alpha"), Some("sha256:d1"));
        assert!(f.cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn first_observation_records_digest_without_restart() {
        let mut f = fixture();
        f.registry.set_repositories(&["alpha"]);
        f.registry.set_digest("alpha", "sha256:d1");
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);

        let report = f.reconciler.run_pass(&mut f.state).await;

        assert!(report.outcomes.is_empty());
        assert_eq!(f.state.digest_of("alpha"), Some("sha256:d1"));
    }

    #[tokio::test]
    async fn changed_digest_restarts_healthy_service() {
        let mut f = fixture();
        f.registry.set_repositories(&["alpha"]);
        f.registry.set_digest("alpha", "sha256:d1");
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);
        f.reconciler.run_pass(&mut f.state).await;

        f.registry.set_digest("alpha", "sha256:d2");
        let report = f.reconciler.run_pass(&mut f.state).await;

        assert_eq!(report.count(ActionKind::Restart), 1);
        assert_eq!(report.outcomes[0].healthy, Some(true));
        assert_eq!(report.rollbacks(), 0);
        assert_eq!(f.state.digest_of("alpha"), Some("sha256:d2"));
        assert_eq!(
            f.cluster.calls(),
            vec![
                ClusterCall::Restart("alpha".into()),
                ClusterCall::Status("alpha".into()),
            ]
        );
    }

    #[tokio::test]
    async fn unhealthy_restart_rolls_back_once_and_keeps_new_digest() {
        let mut f = fixture();
        f.registry.set_repositories(&["alpha"]);
        f.registry.set_digest("alpha", "sha256:d1");
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);
        f.reconciler.run_pass(&mut f.state).await;

        f.registry.set_digest("alpha", "sha256:d2");
        f.cluster.set_unhealthy("alpha");
        let report = f.reconciler.run_pass(&mut f.state).await;

        assert_eq!(report.count(ActionKind::Restart), 1);
        assert_eq!(report.outcomes[0].healthy, Some(false));
        assert_eq!(report.outcomes[0].rolled_back, Some(true));
        assert_eq!(actions(&f.state, ActionKind::Restart), 1);
        assert_eq!(actions(&f.state, ActionKind::Rollback), 1);
        assert_eq!(f.state.digest_of("alpha"), Some("sha256:d2"));

        // The bad image is not retried until its digest moves again.
        let report = f.reconciler.run_pass(&mut f.state).await;
        assert!(report.outcomes.is_empty());
        assert_eq!(actions(&f.state, ActionKind::Restart), 1);
    }

    #[tokio::test]
    async fn on_success_policy_retries_failed_rollout() {
        let mut config = ControllerConfig::default();
        config.auto_deploy_enabled = true;
        config.digest_policy = DigestPolicy::OnSuccess;
        let mut f = fixture_with(config);
        f.registry.set_repositories(&["alpha"]);
        f.registry.set_digest("alpha", "sha256:d1");
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);
        f.reconciler.run_pass(&mut f.state).await;

        f.registry.set_digest("alpha", "sha256:d2");
        f.cluster.set_unhealthy("alpha");
        f.reconciler.run_pass(&mut f.state).await;
        assert_eq!(f.state.digest_of("alpha"), Some("sha256:d1"));

        f.cluster.set_healthy("alpha");
        let report = f.reconciler.run_pass(&mut f.state).await;
        assert_eq!(report.count(ActionKind::Restart), 1);
        assert_eq!(report.outcomes[0].healthy, Some(true));
        assert_eq!(f.state.digest_of("alpha"), Some("sha256:d2"));
    }

    #[tokio::test]
    async fn unhealthy_deploy_rolls_back_once() {
        let mut f = fixture();
        f.registry.set_repositories(&["beta"]);
        f.cluster.set_unhealthy("beta");

        let report = f.reconciler.run_pass(&mut f.state).await;

        assert_eq!(report.rollbacks(), 1);
        assert_eq!(actions(&f.state, ActionKind::Deploy), 1);
        assert_eq!(actions(&f.state, ActionKind::Rollback), 1);
    }

    #[tokio::test]
    async fn failed_apply_is_not_health_checked_or_rolled_back() {
        let mut f = fixture();
        f.registry.set_repositories(&["beta", "gamma"]);
        f.cluster.fail_apply("beta", "quota exceeded");

        let report = f.reconciler.run_pass(&mut f.state).await;

        let beta = &report.outcomes[0];
        assert!(!beta.success);
        assert_eq!(beta.healthy, None);
        assert_eq!(beta.rolled_back, None);
        assert_eq!(actions(&f.state, ActionKind::Rollback), 0);
        // The pass moves on to the next service.
        assert_eq!(report.outcomes[1].service, "gamma");
        assert!(report.outcomes[1].success);
        assert!(!f.cluster.calls().contains(&ClusterCall::Status("beta".into())));
    }

    /// Seed `alpha` at D1, then publish D2 with the restart command failing.
    async fn failed_restart_pass(f: &mut Fixture) -> PassReport {
        f.registry.set_repositories(&["alpha"]);
        f.registry.set_digest("alpha", "sha256:d1");
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);
        f.reconciler.run_pass(&mut f.state).await;

        f.registry.set_digest("alpha", "sha256:d2");
        f.cluster.fail_restart("alpha", "deployments.apps \"alpha\" is forbidden");
        f.reconciler.run_pass(&mut f.state).await
    }

    #[tokio::test]
    async fn failed_restart_is_not_health_checked_or_rolled_back() {
        let mut f = fixture();
        let report = failed_restart_pass(&mut f).await;

        let alpha = &report.outcomes[0];
        assert_eq!(alpha.action, ActionKind::Restart);
        assert!(!alpha.success);
        assert!(alpha.message.contains("forbidden"));
        assert_eq!(alpha.healthy, None);
        assert_eq!(alpha.rolled_back, None);

        let restarts: Vec<_> = f
            .state
            .history
            .records()
            .filter(|r| r.action == ActionKind::Restart)
            .collect();
        assert_eq!(restarts.len(), 1);
        assert!(!restarts[0].success);
        assert_eq!(actions(&f.state, ActionKind::Rollback), 0);
        assert_eq!(f.cluster.calls(), vec![ClusterCall::Restart("alpha".into())]);

        // Default policy: the observed digest is kept, so no retry.
        assert_eq!(f.state.digest_of("alpha"), Some("sha256:d2"));
        let report = f.reconciler.run_pass(&mut f.state).await;
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn failed_restart_holds_digest_under_on_success_policy() {
        let mut config = ControllerConfig::default();
        config.auto_deploy_enabled = true;
        config.health_timeout_secs = 1;
        config.digest_policy = DigestPolicy::OnSuccess;
        let mut f = fixture_with(config);

        let report = failed_restart_pass(&mut f).await;
        assert!(!report.outcomes[0].success);
        assert_eq!(f.state.digest_of("alpha"), Some("sha256:d1"));
        assert_eq!(actions(&f.state, ActionKind::Rollback), 0);

        // Still differs from the stored digest, so the next pass retries.
        let report = f.reconciler.run_pass(&mut f.state).await;
        assert_eq!(report.count(ActionKind::Restart), 1);
        assert_eq!(actions(&f.state, ActionKind::Restart), 2);
    }

    #[tokio::test]
    async fn failed_rollback_is_recorded_not_retried() {
        let mut f = fixture();
        f.registry.set_repositories(&["beta"]);
        f.cluster.set_unhealthy("beta");
        f.cluster.fail_undo("beta", "no rollout history found");

        let report = f.reconciler.run_pass(&mut f.state).await;

        assert_eq!(report.outcomes[0].rolled_back, Some(false));
        let rollbacks: Vec<_> = f
            .state
            .history
            .records()
            .filter(|r| r.action == ActionKind::Rollback)
            .collect();
        assert_eq!(rollbacks.len(), 1);
        assert!(!rollbacks[0].success);
    }

    #[tokio::test]
    async fn gate_off_never_mutates() {
        let mut config = ControllerConfig::default();
        config.auto_deploy_enabled = false;
        let mut f = fixture_with(config);
        f.registry.set_repositories(&["alpha", "beta"]);
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);

        for _ in 0..5 {
            let report = f.reconciler.run_pass(&mut f.state).await;
            assert!(report.gated);
        }

        assert!(f.state.history.is_empty());
        assert!(f.cluster.calls().is_empty());
        assert!(f.state.cluster_snapshot.contains_key("alpha"));
        assert!(f.state.last_check.is_some());
    }

    #[tokio::test]
    async fn suppress_policy_skips_actions_on_cluster_failure() {
        let mut f = fixture();
        f.registry.set_repositories(&["alpha"]);
        f.registry.set_digest("alpha", "sha256:d1");
        f.cluster.set_query_error(Some("connection refused"));

        let report = f.reconciler.run_pass(&mut f.state).await;

        assert!(report.suppressed);
        assert!(report.cluster_error.is_some());
        assert!(f.cluster.calls().is_empty());
        assert_eq!(f.state.digest_of("alpha"), None);
    }

    #[tokio::test]
    async fn treat_as_empty_policy_redeploys_on_cluster_failure() {
        let mut config = ControllerConfig::default();
        config.auto_deploy_enabled = true;
        config.cluster_failure = ClusterFailurePolicy::TreatAsEmpty;
        let mut f = fixture_with(config);
        f.registry.set_repositories(&["alpha"]);
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);
        f.cluster.set_query_error(Some("connection refused"));

        let report = f.reconciler.run_pass(&mut f.state).await;

        assert!(!report.suppressed);
        assert_eq!(report.count(ActionKind::Deploy), 1);
    }

    #[tokio::test]
    async fn empty_registry_does_nothing() {
        let mut f = fixture();
        f.cluster.add_deployment("alpha", "localhost:31500/alpha:latest", 1);
        f.registry.set_unreachable(true);

        let report = f.reconciler.run_pass(&mut f.state).await;

        assert_eq!(report.repositories, 0);
        assert!(report.outcomes.is_empty());
        assert!(f.cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn manual_deploy_strips_registry_prefix_and_skips_gate() {
        let mut config = ControllerConfig::default();
        config.auto_deploy_enabled = false;
        let mut f = fixture_with(config);

        let (service, outcome) = f
            .reconciler
            .deploy_manual(&mut f.state, "holm/orders", 2)
            .await;

        assert_eq!(service, "orders");
        assert!(outcome.success);
        assert_eq!(f.cluster.calls(), vec![ClusterCall::Apply("orders".into(), 2)]);
        assert_eq!(f.state.history.recent(1)[0].trigger, Trigger::Manual);
    }

    #[tokio::test]
    async fn manual_rollback_is_recorded() {
        let mut f = fixture();
        let outcome = f.reconciler.rollback_manual(&mut f.state, "orders").await;
        assert!(outcome.success);
        let record = &f.state.history.recent(1)[0];
        assert_eq!(record.action, ActionKind::Rollback);
        assert_eq!(record.trigger, Trigger::Manual);
    }
}
