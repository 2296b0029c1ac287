// Evidence Graph - main.rs
// Loads layered configuration, installs tracing and dispatches the CLI.

use clap::Parser;
use std::str::FromStr;
use tracing::Level;

use evidence_graph::cli::{self, Cli};
use evidence_graph::config::EvidenceConfig;
use evidence_graph::runtime::EvidenceRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = EvidenceConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_max_level(Level::from_str(&config.log.level).unwrap_or(Level::INFO))
        .with_target(false)
        .init();

    let runtime = EvidenceRuntime::from_config(config)?;
    cli::run(cli, runtime).await
}
