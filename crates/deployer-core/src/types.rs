use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Deploy,
    Restart,
    Rollback,
}

impl ActionKind {
    pub fn all() -> &'static [ActionKind] {
        &[ActionKind::Deploy, ActionKind::Restart, ActionKind::Rollback]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Deploy => "deploy",
            ActionKind::Restart => "restart",
            ActionKind::Rollback => "rollback",
        }
    }

    /// Whether a successful action of this kind must be followed by a health check.
    pub fn needs_health_check(self) -> bool {
        matches!(self, ActionKind::Deploy | ActionKind::Restart)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = crate::error::DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" => Ok(ActionKind::Deploy),
            "restart" => Ok(ActionKind::Restart),
            "rollback" => Ok(ActionKind::Rollback),
            _ => Err(crate::error::DeployError::Config(format!(
                "unknown action '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// What caused an action: the reconciliation loop or an operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Auto,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Auto => "auto",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DeploymentInfo
// ---------------------------------------------------------------------------

/// One deployment as observed in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub image: String,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
}

impl DeploymentInfo {
    pub fn is_ready(&self) -> bool {
        self.ready_replicas >= self.desired_replicas
    }

    pub fn status(&self) -> &'static str {
        if self.is_ready() {
            "running"
        } else {
            "pending"
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceRecord
// ---------------------------------------------------------------------------

/// A service tracked by the controller, keyed by registry repository name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub image: String,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub last_known_digest: Option<String>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: String::new(),
            desired_replicas: 0,
            ready_replicas: 0,
            last_known_digest: None,
        }
    }

    /// Copy the observed cluster fields onto this record.
    pub fn observe(&mut self, info: &DeploymentInfo) {
        self.image = info.image.clone();
        self.desired_replicas = info.desired_replicas;
        self.ready_replicas = info.ready_replicas;
    }
}

// ---------------------------------------------------------------------------
// RegistryImage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryImage {
    #[serde(rename = "name")]
    pub repository: String,
    pub tags: Vec<String>,
}

/// Map a requested image reference to the service name it deploys as.
///
/// The registry namespaces some images under `holm/`; the deployment never
/// carries that prefix.
pub fn service_name_for_image(image: &str) -> &str {
    image.strip_prefix("holm/").unwrap_or(image)
}

/// Check that `name` can be used as a Deployment and Service name.
pub fn validate_service_name(name: &str) -> crate::error::Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(crate::error::DeployError::InvalidServiceName(
            name.to_string(),
        ))
    }
}
