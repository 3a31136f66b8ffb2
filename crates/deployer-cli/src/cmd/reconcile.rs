use std::sync::Arc;

use anyhow::Context;
use deployer_core::cluster;
use deployer_core::config::ControllerConfig;
use deployer_core::reconciler::{PassReport, Reconciler, ServiceOutcome};
use deployer_core::registry::RegistryClient;
use deployer_core::state::ControllerState;

/// Run one pass from a fresh state with the gate open.
///
/// With no digest history a one-shot pass can only deploy missing services;
/// restarts need the long-running controller.
pub fn run(mut config: ControllerConfig, json: bool) -> anyhow::Result<()> {
    config.auto_deploy_enabled = true;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let registry = Arc::new(
            RegistryClient::new(config.registry.url.clone()).context("registry client")?,
        );
        let cluster = cluster::connect(&config)
            .await
            .context("cluster client")?;
        let reconciler = Reconciler::new(&config, registry, cluster);
        let mut state = ControllerState::new(&config);
        anyhow::Ok(reconciler.run_pass(&mut state).await)
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print_report(&report);
    if report.suppressed {
        anyhow::bail!("cluster query failed; no actions taken");
    }
    Ok(())
}

const HEADERS: [&str; 5] = ["SERVICE", "ACTION", "RESULT", "HEALTHY", "ROLLED BACK"];

fn print_report(report: &PassReport) {
    if let Some(e) = &report.cluster_error {
        eprintln!("cluster query failed: {e}");
    }
    if report.outcomes.is_empty() {
        println!(
            "Nothing to do: {} repositories checked.",
            report.repositories
        );
        return;
    }
    print!("{}", render_table(report));
}

fn row(outcome: &ServiceOutcome) -> [String; 5] {
    let healthy = match outcome.healthy {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    };
    let rolled_back = match outcome.rolled_back {
        Some(true) => "yes",
        Some(false) => "failed",
        None => "-",
    };
    [
        outcome.service.clone(),
        outcome.action.to_string(),
        if outcome.success { "ok" } else { "failed" }.to_string(),
        healthy.to_string(),
        rolled_back.to_string(),
    ]
}

/// One line per outcome, columns padded to the widest cell.
fn render_table(report: &PassReport) -> String {
    let rows: Vec<[String; 5]> = report.outcomes.iter().map(row).collect();
    let mut widths = HEADERS.map(str::len);
    for r in &rows {
        for (w, cell) in widths.iter_mut().zip(r) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = line(HEADERS.iter().copied(), &widths);
    for r in &rows {
        out.push_str(&line(r.iter().map(String::as_str), &widths));
    }
    out
}

fn line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize; 5]) -> String {
    let padded: Vec<String> = cells
        .zip(widths)
        .map(|(c, w)| format!("{c:w$}", w = *w))
        .collect();
    format!("{}\n", padded.join("  ").trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deployer_core::types::ActionKind;

    fn outcome(service: &str, action: ActionKind, healthy: Option<bool>) -> ServiceOutcome {
        ServiceOutcome {
            service: service.to_string(),
            action,
            success: true,
            healthy,
            rolled_back: healthy.filter(|h| !h).map(|_| true),
            message: String::new(),
        }
    }

    #[test]
    fn table_aligns_columns() {
        let report = PassReport {
            started_at: Utc::now(),
            gated: false,
            suppressed: false,
            cluster_error: None,
            repositories: 2,
            outcomes: vec![
                outcome("orders", ActionKind::Deploy, Some(true)),
                outcome("inventory-api", ActionKind::Restart, Some(false)),
            ],
        };
        let table = render_table(&report);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("SERVICE        ACTION"));
        assert!(lines[1].starts_with("orders         deploy   ok"));
        assert!(lines[2].ends_with("no       yes"));
    }
}
