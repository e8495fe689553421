use anyhow::{Context, Result};
use clap::Parser;
use oltpoll::cli::{Args, Commands};
use oltpoll::coordinator::ExecutionMode;
use oltpoll::dispatch::MockPollingClient;
use oltpoll::registry::{DeviceRef, LinearIndexResolver, StaticDeviceRegistry};
use oltpoll::{PollerConfig, PollerSystem};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oltpoll=info".into()),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run {
            config,
            devices,
            simulate,
            event_log,
        } => run(config, devices, simulate, event_log).await,
        Commands::ShowConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Validate { config } => {
            PollerConfig::from_toml_file(&config)?;
            println!("Configuration {} is valid", config.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PollerConfig> {
    match path {
        Some(path) => PollerConfig::from_toml_file(path),
        None => Ok(PollerConfig::default()),
    }
}

async fn load_devices(path: Option<&Path>) -> Result<Vec<DeviceRef>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read device inventory: {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse device inventory: {}", path.display()))
}

async fn run(
    config_path: Option<PathBuf>,
    devices_path: Option<PathBuf>,
    simulate: bool,
    event_log_path: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let devices = load_devices(devices_path.as_deref()).await?;
    info!("Starting with {} devices from inventory", devices.len());

    let registry = Arc::new(StaticDeviceRegistry::new(devices));
    // The real polling client is an external collaborator; the bundled
    // mock carries both simulation runs and environments without one.
    let client = Arc::new(MockPollingClient::new());
    let resolver = Arc::new(LinearIndexResolver::default());
    let mode = if simulate {
        ExecutionMode::Simulation
    } else {
        ExecutionMode::Live
    };

    let system = PollerSystem::new(config, registry, client, resolver, mode)?;

    let runner = system.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    system.shutdown().await;

    if let Some(path) = event_log_path {
        match system.events().flush_to(&path).await {
            Ok(written) => info!("Flushed {} audit entries to {}", written, path.display()),
            Err(err) => error!("Failed to flush event log: {:#}", err),
        }
    }

    run_handle.await??;
    Ok(())
}
