//! Mutating cluster actions. Each call is bounded by the action timeout and
//! appends exactly one [`ActionRecord`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterClient;
use crate::error::{DeployError, Result};
use crate::history::{ActionRecord, HistoryLog};
use crate::manifest::ManifestTemplate;
use crate::types::{ActionKind, Trigger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

pub struct ActionExecutor {
    cluster: Arc<dyn ClusterClient>,
    template: ManifestTemplate,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(cluster: Arc<dyn ClusterClient>, template: ManifestTemplate, timeout: Duration) -> Self {
        Self {
            cluster,
            template,
            timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.template.namespace
    }

    /// Render and apply the manifest for `service`.
    pub async fn deploy(
        &self,
        history: &mut HistoryLog,
        service: &str,
        replicas: i32,
        trigger: Trigger,
    ) -> ActionOutcome {
        let result = match self.template.render(service, replicas) {
            Ok(manifest) => {
                let cluster = Arc::clone(&self.cluster);
                self.bounded("apply", async move { cluster.apply(&manifest).await })
                    .await
            }
            Err(e) => Err(e),
        };
        self.record(history, ActionKind::Deploy, service, trigger, result)
    }

    /// Force a rolling restart so pods re-pull the mutable tag.
    pub async fn restart(
        &self,
        history: &mut HistoryLog,
        service: &str,
        trigger: Trigger,
    ) -> ActionOutcome {
        let result = self
            .bounded(
                "rollout restart",
                self.cluster.rollout_restart(self.namespace(), service),
            )
            .await;
        self.record(history, ActionKind::Restart, service, trigger, result)
    }

    /// Revert `service` to its previous revision.
    pub async fn rollback(
        &self,
        history: &mut HistoryLog,
        service: &str,
        trigger: Trigger,
    ) -> ActionOutcome {
        let result = self
            .bounded(
                "rollout undo",
                self.cluster.rollout_undo(self.namespace(), service),
            )
            .await;
        self.record(history, ActionKind::Rollback, service, trigger, result)
    }

    async fn bounded<F>(&self, operation: &str, fut: F) -> Result<String>
    where
        F: Future<Output = Result<String>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DeployError::Timeout {
                operation: operation.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    fn record(
        &self,
        history: &mut HistoryLog,
        action: ActionKind,
        service: &str,
        trigger: Trigger,
        result: Result<String>,
    ) -> ActionOutcome {
        let outcome = match result {
            Ok(output) => {
                tracing::info!(%action, service, %trigger, output = %output, "action succeeded");
                ActionOutcome {
                    success: true,
                    message: output,
                }
            }
            Err(e) => {
                tracing::error!(%action, service, %trigger, error = %e, "action failed");
                ActionOutcome {
                    success: false,
                    message: e.to_string(),
                }
            }
        };
        history.append(ActionRecord::new(
            action,
            service,
            outcome.success,
            outcome.message.clone(),
            trigger,
        ));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::testkit::{ClusterCall, FakeCluster};

    fn executor(cluster: Arc<FakeCluster>, timeout: Duration) -> ActionExecutor {
        ActionExecutor::new(
            cluster,
            ManifestTemplate::from_config(&ControllerConfig::default()),
            timeout,
        )
    }

    #[tokio::test]
    async fn deploy_applies_rendered_manifest_and_records() {
        let cluster = Arc::new(FakeCluster::new());
        let exec = executor(cluster.clone(), Duration::from_secs(5));
        let mut history = HistoryLog::new();

        let outcome = exec.deploy(&mut history, "orders", 3, Trigger::Manual).await;

        assert!(outcome.success);
        assert_eq!(cluster.calls(), vec![ClusterCall::Apply("orders".into(), 3)]);
        let records = history.recent(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, ActionKind::Deploy);
        assert_eq!(records[0].trigger, Trigger::Manual);
        assert!(records[0].success);
    }

    #[tokio::test]
    async fn failed_apply_is_recorded_as_failure() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_apply("orders", "admission webhook denied");
        let exec = executor(cluster, Duration::from_secs(5));
        let mut history = HistoryLog::new();

        let outcome = exec.deploy(&mut history, "orders", 1, Trigger::Auto).await;

        assert!(!outcome.success);
        assert!(outcome.message.contains("admission webhook denied"));
        assert!(!history.recent(1)[0].success);
    }

    #[tokio::test]
    async fn invalid_name_never_reaches_the_cluster() {
        let cluster = Arc::new(FakeCluster::new());
        let exec = executor(cluster.clone(), Duration::from_secs(5));
        let mut history = HistoryLog::new();

        let outcome = exec.deploy(&mut history, "Bad_Name", 1, Trigger::Manual).await;

        assert!(!outcome.success);
        assert!(cluster.calls().is_empty());
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn slow_action_times_out() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.set_action_delay(Duration::from_millis(500));
        let exec = executor(cluster, Duration::from_millis(50));
        let mut history = HistoryLog::new();

        let outcome = exec.restart(&mut history, "orders", Trigger::Auto).await;

        assert!(!outcome.success);
        assert!(outcome.message.contains("timed out"));
        assert_eq!(history.recent(1)[0].action, ActionKind::Restart);
    }

    #[tokio::test]
    async fn rollback_records_one_entry() {
        let cluster = Arc::new(FakeCluster::new());
        let exec = executor(cluster.clone(), Duration::from_secs(5));
        let mut history = HistoryLog::new();

        let outcome = exec.rollback(&mut history, "orders", Trigger::Manual).await;

        assert!(outcome.success);
        assert_eq!(cluster.calls(), vec![ClusterCall::Undo("orders".into())]);
        assert_eq!(history.len(), 1);
        assert_eq!(history.recent(1)[0].action, ActionKind::Rollback);
    }
}
