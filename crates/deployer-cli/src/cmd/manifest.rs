use deployer_core::config::ControllerConfig;
use deployer_core::manifest::ManifestTemplate;

/// Render the manifest `deploy` would apply, without touching the cluster.
pub fn run(config: &ControllerConfig, service: &str, replicas: i32, json: bool) -> anyhow::Result<()> {
    let manifest = ManifestTemplate::from_config(config).render(service, replicas)?;
    if json {
        let value = serde_json::json!({
            "deployment": manifest.deployment,
            "service": manifest.service,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    } else {
        print!("{}", manifest.to_yaml()?);
        Ok(())
    }
}
