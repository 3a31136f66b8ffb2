use std::sync::Arc;

use deployer_core::cluster::ClusterClient;
use deployer_core::config::ControllerConfig;
use deployer_core::registry::ImageRegistry;
use deployer_core::ControllerHandle;

/// Shared state for every handler. Controller state itself lives in the
/// controller task; handlers reach it through `controller`.
#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
    pub registry: Arc<dyn ImageRegistry>,
    pub cluster: Arc<dyn ClusterClient>,
    pub namespace: String,
    pub history_limit: usize,
}

impl AppState {
    pub fn new(
        config: &ControllerConfig,
        controller: ControllerHandle,
        registry: Arc<dyn ImageRegistry>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            controller,
            registry,
            cluster,
            namespace: config.cluster.namespace.clone(),
            history_limit: config.history_limit,
        }
    }
}
