//! fleetmon installer
//!
//! Deploys the monitoring stack described by a declarative configuration
//! across a fleet of SSH-reachable hosts. Every run gets a timestamped
//! workspace directory holding the audit copy of the configuration, the
//! rendered per-host agent configurations and the run log.

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use fleetmon_core::Orchestrator;

const DEFAULT_CONFIG: &str = "/etc/fleetmon.conf";
const DEFAULT_LOG_DIR: &str = "/var/log/fleetmon-install";

#[derive(Parser)]
#[command(name = "fleetmon")]
#[command(about = "Install the fleet monitoring stack", long_about = None)]
struct Cli {
    /// Configuration file describing the fleet
    #[arg(default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Directory collecting per-run workspaces
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let identity = chrono::Local::now().format("%Y-%m-%d-%H_%M_%S").to_string();
    let workspace = cli.log_dir.join(identity);
    std::fs::create_dir_all(&workspace)?;

    let log_file = std::fs::File::create(workspace.join("fleetmon_install.log"))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr.and(Mutex::new(log_file)))
        .with_ansi(false)
        .init();

    println!(
        "Installing the monitoring stack using config [{}], see [{}] for logs",
        cli.config.display(),
        workspace.display()
    );

    let orchestrator = Orchestrator::default();
    if let Err(e) = orchestrator.install(&workspace, &cli.config).await {
        error!(error = %e, workspace = %workspace.display(), "installation failed");
        return Err(eyre!(
            "installation failed: {e}, see [{}] for the full log",
            workspace.display()
        ));
    }

    info!(workspace = %workspace.display(), "monitoring stack installed");
    Ok(())
}
