//! `ClusterClient` backed by the `kubectl` binary.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{deployment_info, ClusterClient, DeploymentMap};
use crate::config::ControllerConfig;
use crate::error::{DeployError, Result};
use crate::manifest::ServiceManifest;

/// Upper bound for commands that do not carry their own `--timeout`.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
/// Extra time given to `rollout status` beyond its own `--timeout`.
const STATUS_GRACE: Duration = Duration::from_secs(10);

pub struct KubectlClient {
    program: String,
    command_timeout: Duration,
}

/// `kubectl get ... -o json` returns a generic `List`, not a typed `DeploymentList`.
#[derive(Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Vec<Deployment>,
}

impl KubectlClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            command_timeout: COMMAND_TIMEOUT,
        }
    }

    /// The configured binary, with `apply`, `rollout restart` and
    /// `rollout undo` bounded by `action_timeout_secs`.
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.cluster.kubectl.clone()).with_command_timeout(config.action_timeout())
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run kubectl with `args`, optionally feeding `stdin`, and return stdout.
    ///
    /// A non-zero exit maps to `CommandFailed` carrying stderr; exceeding
    /// `timeout` kills the child and maps to `Timeout`.
    pub async fn run(&self, args: &[&str], stdin: Option<&str>, timeout: Duration) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let command = format!("{} {}", self.program, args.join(" "));
        tracing::debug!(command = %command, "running kubectl");

        let mut child = cmd.spawn().map_err(|e| DeployError::SpawnFailed {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                // Close stdin so `apply -f -` sees EOF.
                drop(pipe);
            }
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeployError::Timeout {
                    operation: command,
                    seconds: timeout.as_secs(),
                })
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(DeployError::CommandFailed { command, stderr })
        }
    }
}

/// Parse `kubectl get deployments -o json`.
pub fn parse_deployment_list(json: &str) -> Result<DeploymentMap> {
    let list: ItemList = serde_json::from_str(json)?;
    Ok(list.items.iter().filter_map(deployment_info).collect())
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn get_deployments(&self, namespace: &str) -> Result<DeploymentMap> {
        let out = self
            .run(
                &["get", "deployments", "-n", namespace, "-o", "json"],
                None,
                self.command_timeout,
            )
            .await
            .map_err(|e| DeployError::Cluster(e.to_string()))?;
        parse_deployment_list(&out)
    }

    async fn apply(&self, manifest: &ServiceManifest) -> Result<String> {
        let yaml = manifest.to_yaml()?;
        self.run(&["apply", "-f", "-"], Some(&yaml), self.command_timeout)
            .await
    }

    async fn rollout_restart(&self, namespace: &str, name: &str) -> Result<String> {
        self.run(
            &["rollout", "restart", "deployment", name, "-n", namespace],
            None,
            self.command_timeout,
        )
        .await
    }

    async fn rollout_undo(&self, namespace: &str, name: &str) -> Result<String> {
        self.run(
            &["rollout", "undo", "deployment", name, "-n", namespace],
            None,
            self.command_timeout,
        )
        .await
    }

    async fn rollout_status(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let timeout_arg = format!("{}s", timeout.as_secs());
        let result = self
            .run(
                &[
                    "rollout",
                    "status",
                    "deployment",
                    name,
                    "-n",
                    namespace,
                    "--timeout",
                    &timeout_arg,
                ],
                None,
                timeout + STATUS_GRACE,
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(DeployError::CommandFailed { stderr, .. }) => {
                tracing::warn!(deployment = name, stderr = %stderr, "rollout did not converge");
                Ok(false)
            }
            Err(DeployError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ping(&self) -> bool {
        if which::which(&self.program).is_err() {
            return false;
        }
        self.run(&["version", "--client"], None, Duration::from_secs(10))
            .await
            .is_ok()
    }

    fn backend(&self) -> &'static str {
        "kubectl"
    }
}
