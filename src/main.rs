use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use quorum_testcontainer::builder::QuorumBuilder;
use quorum_testcontainer::config::BuilderSettings;
use quorum_testcontainer::docker::DockerEngine;
use quorum_testcontainer::engine::ContainerEngine;

#[derive(Parser, Debug)]
#[command(
    name = "quorum-testnet",
    about = "Provision ephemeral Quorum test networks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the network described by a YAML file and keep it up until Ctrl-C.
    Up {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Remove every resource labeled with a build name.
    Down { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let settings = BuilderSettings::from_env()?;
    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::connect()?);

    match cli.command {
        Command::Up { file } => up(engine, settings, file).await,
        Command::Down { name } => QuorumBuilder::destroy_labeled(engine, &name).await,
    }
}

async fn up(
    engine: Arc<dyn ContainerEngine>,
    settings: BuilderSettings,
    file: PathBuf,
) -> Result<()> {
    let topology = File::open(&file).with_context(|| format!("open {}", file.display()))?;
    let shutdown_timeout = Duration::from_secs(settings.shutdown_timeout_secs);
    let mut builder = QuorumBuilder::from_reader(topology, engine)?.with_settings(settings);

    if let Err(err) = builder.build().await {
        error!("build of {} failed: {:#}", builder.name(), err);
        if let Err(cleanup) = builder.destroy().await {
            error!("cleanup of {} failed: {:#}", builder.name(), cleanup);
        }
        return Err(err);
    }

    let nodes = builder.directory().list().await;
    println!("{}", serde_json::to_string_pretty(&nodes)?);
    info!(
        "Network {} is up, press Ctrl-C to tear it down",
        builder.name()
    );

    tokio::signal::ctrl_c().await?;
    info!("Tearing down {}", builder.name());
    tokio::time::timeout(shutdown_timeout, builder.destroy())
        .await
        .with_context(|| {
            format!("teardown did not finish within {:?}", shutdown_timeout)
        })?
}
