use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use deployer_core::cluster;
use deployer_core::config::{ControllerConfig, WarnLevel};
use deployer_core::registry::RegistryClient;
use deployer_core::Controller;
use deployer_server::AppState;

/// How long to wait for an in-flight pass after the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub fn run(mut config: ControllerConfig, port: u16, auto_deploy: bool) -> anyhow::Result<()> {
    if auto_deploy {
        config.auto_deploy_enabled = true;
    }
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("config: {}", w.message),
            WarnLevel::Error => tracing::error!("config: {}", w.message),
        }
    }
    if config.has_errors() {
        anyhow::bail!("refusing to start with an invalid config");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let registry = Arc::new(
            RegistryClient::new(config.registry.url.clone()).context("registry client")?,
        );
        let cluster = cluster::connect(&config)
            .await
            .context("cluster client")?;

        let (handle, task) = Controller::start(&config, registry.clone(), cluster.clone());
        let state = AppState::new(&config, handle.clone(), registry, cluster);

        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        let actual_port = listener.local_addr()?.port();
        println!(
            "deployer watching {} -> namespace '{}' on http://localhost:{actual_port} (auto-deploy {})",
            config.registry.url,
            config.cluster.namespace,
            if config.auto_deploy_enabled { "on" } else { "off" },
        );

        let result = tokio::select! {
            res = deployer_server::serve_on(state, listener) => res,
            _ = tokio::signal::ctrl_c() => Ok(()),
        };

        let _ = handle.shutdown().await;
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            tracing::warn!("controller did not stop in time; abandoning in-flight pass");
        }
        result
    })
}
