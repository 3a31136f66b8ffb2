use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// When the cached digest of a service is advanced after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestPolicy {
    /// Always record the digest seen this pass, even if the rollout failed.
    /// A persistently unhealthy image is not retried until its digest changes.
    #[default]
    Always,
    /// Only record the digest when the triggered action passed its health
    /// check, so a failed rollout is retried on the next pass.
    OnSuccess,
}

/// What a pass does when the deployment query itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterFailurePolicy {
    /// Skip every mutating action for the pass.
    #[default]
    Suppress,
    /// Treat the failure as an empty namespace; apply is idempotent, so every
    /// registry service gets (re)deployed.
    TreatAsEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBackend {
    /// Shell out to the `kubectl` binary.
    #[default]
    Kubectl,
    /// Talk to the API server directly.
    Kube,
}

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub url: String,
    /// Registry host as seen by the cluster's container runtime.
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_registry_url() -> String {
    "http://registry.holm.svc.cluster.local:5000".to_string()
}

fn default_image_prefix() -> String {
    "localhost:31500".to_string()
}

fn default_tag() -> String {
    "latest".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            image_prefix: default_image_prefix(),
            tag: default_tag(),
        }
    }
}

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub backend: ClusterBackend,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default = "default_container_port")]
    pub container_port: i32,
    /// Node that must never run managed pods.
    #[serde(default = "default_excluded_host")]
    pub excluded_host: Option<String>,
}

fn default_namespace() -> String {
    "holm".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_container_port() -> i32 {
    8080
}

fn default_excluded_host() -> Option<String> {
    Some("openmediavault".to_string())
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            backend: ClusterBackend::default(),
            kubectl: default_kubectl(),
            container_port: default_container_port(),
            excluded_host: default_excluded_host(),
        }
    }
}

// ---------------------------------------------------------------------------
// ControllerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub auto_deploy_enabled: bool,
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Pause after a pass that errored before the loop resumes.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_replicas")]
    pub default_replicas: i32,
    #[serde(default)]
    pub digest_policy: DigestPolicy,
    #[serde(default)]
    pub cluster_failure: ClusterFailurePolicy,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_action_timeout() -> u64 {
    60
}

fn default_health_timeout() -> u64 {
    120
}

fn default_error_backoff() -> u64 {
    10
}

fn default_history_limit() -> usize {
    50
}

fn default_replicas() -> i32 {
    1
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            auto_deploy_enabled: false,
            action_timeout_secs: default_action_timeout(),
            health_timeout_secs: default_health_timeout(),
            error_backoff_secs: default_error_backoff(),
            history_limit: default_history_limit(),
            default_replicas: default_replicas(),
            digest_policy: DigestPolicy::default(),
            cluster_failure: ClusterFailurePolicy::default(),
            registry: RegistryConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load from a YAML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: ControllerConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    /// Load `path` when given, otherwise start from defaults; then apply
    /// environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `REGISTRY_URL`, `DEPLOYER_NAMESPACE` and `DEPLOYER_AUTO_DEPLOY`.
    ///
    /// The lookup is injected so tests do not touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REGISTRY_URL").filter(|v| !v.is_empty()) {
            self.registry.url = normalize_registry_url(&url);
        }
        if let Some(ns) = lookup("DEPLOYER_NAMESPACE").filter(|v| !v.is_empty()) {
            self.cluster.namespace = ns;
        }
        if let Some(flag) = lookup("DEPLOYER_AUTO_DEPLOY") {
            self.auto_deploy_enabled = parse_bool(&flag).ok_or_else(|| {
                DeployError::Config(format!("DEPLOYER_AUTO_DEPLOY: not a boolean: '{flag}'"))
            })?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the config for values that will not work or are suspicious.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.poll_interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "poll_interval_secs must be greater than zero".to_string(),
            });
        }
        if self.cluster.namespace.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "cluster.namespace is empty".to_string(),
            });
        }
        if !(1..=65535).contains(&self.cluster.container_port) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "cluster.container_port={} is outside 1..=65535",
                    self.cluster.container_port
                ),
            });
        }
        if self.default_replicas < 1 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("default_replicas={} must be at least 1", self.default_replicas),
            });
        }
        if !self.registry.url.starts_with("http://") && !self.registry.url.starts_with("https://")
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("registry.url '{}' has no http(s) scheme", self.registry.url),
            });
        }
        if self.health_timeout_secs < self.action_timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "health_timeout_secs={} is shorter than action_timeout_secs={}",
                    self.health_timeout_secs, self.action_timeout_secs
                ),
            });
        }
        if self.history_limit == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "history_limit=0 hides all actions from /api/history".to_string(),
            });
        }
        if self.digest_policy == DigestPolicy::OnSuccess && self.auto_deploy_enabled {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "digest_policy=on_success retries failed rollouts every pass".to_string(),
            });
        }

        warnings
    }

    /// True when `validate()` produced at least one error-level warning.
    pub fn has_errors(&self) -> bool {
        self.validate().iter().any(|w| w.level == WarnLevel::Error)
    }
}

/// Accept `host:port` registry addresses by defaulting to plain http.
pub fn normalize_registry_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
