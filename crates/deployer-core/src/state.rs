use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::DeploymentMap;
use crate::config::ControllerConfig;
use crate::history::HistoryLog;
use crate::types::ServiceRecord;

// ---------------------------------------------------------------------------
// ControllerState
// ---------------------------------------------------------------------------

/// Everything the controller knows. Owned by the controller task; nothing
/// else holds a reference to it.
#[derive(Debug)]
pub struct ControllerState {
    pub services: BTreeMap<String, ServiceRecord>,
    pub cluster_snapshot: DeploymentMap,
    pub history: HistoryLog,
    pub auto_deploy_enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub poll_interval: Duration,
    pub namespace: String,
}

impl ControllerState {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            services: BTreeMap::new(),
            cluster_snapshot: DeploymentMap::new(),
            history: HistoryLog::new(),
            auto_deploy_enabled: config.auto_deploy_enabled,
            last_check: None,
            poll_interval: config.poll_interval(),
            namespace: config.cluster.namespace.clone(),
        }
    }

    /// The record for `name`, created on first sight.
    pub fn service_mut(&mut self, name: &str) -> &mut ServiceRecord {
        self.services
            .entry(name.to_string())
            .or_insert_with(|| ServiceRecord::new(name))
    }

    pub fn digest_of(&self, name: &str) -> Option<&str> {
        self.services
            .get(name)
            .and_then(|r| r.last_known_digest.as_deref())
    }

    /// Replace the cluster snapshot and refresh the observed fields of
    /// every tracked service that appears in it.
    pub fn refresh_snapshot(&mut self, deployments: DeploymentMap) {
        for (name, record) in self.services.iter_mut() {
            if let Some(info) = deployments.get(name) {
                record.observe(info);
            }
        }
        self.cluster_snapshot = deployments;
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            auto_deploy: self.auto_deploy_enabled,
            poll_interval_secs: self.poll_interval.as_secs(),
            last_check: self.last_check,
            services: self.services.len(),
            namespace: self.namespace.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ControllerStatus
// ---------------------------------------------------------------------------

/// Point-in-time copy of the controller's settings, served by `/api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub auto_deploy: bool,
    pub poll_interval_secs: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub services: usize,
    pub namespace: String,
}
