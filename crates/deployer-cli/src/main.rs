mod cmd;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use deployer_core::config::ControllerConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "deployer",
    about = "Continuous deployment controller: keeps a cluster namespace in step with an image registry",
    version,
    propagate_version = true
)]
struct Cli {
    /// Controller config file (YAML). Defaults apply when omitted.
    #[arg(long, global = true, env = "DEPLOYER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the target namespace
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller loop and the HTTP API
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080", env = "PORT")]
        port: u16,

        /// Start with auto-deploy enabled
        #[arg(long)]
        auto_deploy: bool,
    },

    /// Run a single reconciliation pass and print what it did
    Reconcile,

    /// Print the manifest the controller would apply for a service
    Manifest {
        service: String,

        #[arg(long, default_value = "1")]
        replicas: i32,
    },

    /// Inspect and validate the controller config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// File, then environment, then command-line flags.
fn load_config(cli: &Cli) -> anyhow::Result<ControllerConfig> {
    let mut config = ControllerConfig::resolve(cli.config.as_deref())?;
    if let Some(ns) = &cli.namespace {
        config.cluster.namespace = ns.clone();
    }
    Ok(config)
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = load_config(&cli).and_then(|config| match cli.command {
        Commands::Serve { port, auto_deploy } => cmd::serve::run(config, port, auto_deploy),
        Commands::Reconcile => cmd::reconcile::run(config, cli.json),
        Commands::Manifest { service, replicas } => {
            cmd::manifest::run(&config, &service, replicas, cli.json)
        }
        Commands::Config { subcommand } => cmd::config::run(&config, subcommand, cli.json),
    });

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
