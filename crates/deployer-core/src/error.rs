use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("cluster query failed: {0}")]
    Cluster(String),

    #[error("command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("invalid service name '{0}': must be a lowercase RFC 1123 label")]
    InvalidServiceName(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("no previous revision to roll back to for '{0}'")]
    NoPreviousRevision(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("controller is not running")]
    ControllerStopped,

    #[error("reconciliation pass panicked: {0}")]
    PassFailed(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;
