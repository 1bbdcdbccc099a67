//! `sample_flow` command line.
//!
//! Loads the configuration and the sample hierarchy. With `--dry-run` it prints the load report
//! and the hierarchy as JSON and exits. Otherwise it starts the workflow with logging
//! collaborators, waits for Ctrl-C and prints the final run report.

use anyhow::{Context, Result};
use clap::Parser;
use sample_flow::collaborators::CollaboratorSet;
use sample_flow::config::Settings;
use sample_flow::run;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sample_flow", version, about = "Plate microscopy sample workflow")]
struct Args {
    /// Configuration file (TOML or YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Load and print the hierarchy without starting the workflow
    #[arg(long)]
    dry_run: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let settings = Settings::load_from(&args.config)
        .with_context(|| format!("Failed to load configuration '{}'", args.config.display()))?;

    if args.dry_run {
        let (store, load) = run::build_hierarchy(&settings)?;
        let output = serde_json::json!({
            "load": load,
            "hierarchy": store.tree(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let run = run::bootstrap(settings, CollaboratorSet::logging())
        .await
        .context("Failed to start run")?;
    println!("{}", serde_json::to_string_pretty(&run.load)?);

    info!("Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let report = run.shutdown().await?;
    println!("{}", report.to_json()?);
    Ok(())
}
