//! Device Keeper CLI Entry Point
//!
//! This is the main entry point for the Device Keeper binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use device_keeper::cli::config::Config;
use device_keeper::cli::logging;
use device_keeper::connection::scheduler::{build_runtime, Scheduler};
use device_keeper::connection::target::{agent_url, Channel};
use device_keeper::connection::websocket::WsDialer;
use device_keeper::directory::adapter::TargetSource;
use device_keeper::directory::http::DirectoryClient;
use device_keeper::keeper::ConnectionKeeper;
use device_keeper::sync::pool::DevicePoolClient;
use device_keeper::sync::{DeviceSync, DisabledSync};

#[derive(Parser)]
#[command(name = "device-keeper")]
#[command(author, version, about = "Device Keeper - keeps agent connections open for every online device")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/keeper.toml", env = "DEVICE_KEEPER_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the keeper until interrupted
    Start,
    /// Query the directory once and print every agent URL
    Targets,
    /// Validate the configuration and print the effective values
    CheckConfig,
    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(&cli.config, cli.verbose)?;
            let pool_size = config.scheduler.pool_size();
            let runtime = build_runtime(pool_size).context("Failed to build tokio runtime")?;
            runtime.block_on(start_keeper(config, pool_size))?;
        }
        Commands::Targets => {
            let config = load_config(&cli.config, cli.verbose)?;
            let runtime = build_runtime(2).context("Failed to build tokio runtime")?;
            runtime.block_on(show_targets(&config))?;
        }
        Commands::CheckConfig => {
            check_config(&cli.config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn load_config(path: &Path, verbose: bool) -> Result<Config> {
    let config = Config::load(path)?;
    logging::init(&config.logging, verbose)?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn directory_client(config: &Config) -> Result<DirectoryClient> {
    DirectoryClient::from_config(
        &config.directory,
        Duration::from_secs(config.discovery.query_timeout_secs),
    )
    .context("Failed to initialize directory client")
}

async fn start_keeper(config: Config, pool_size: usize) -> Result<()> {
    info!("Starting Device Keeper...");

    let directory = Arc::new(directory_client(&config)?);

    let sync: Arc<dyn DeviceSync> = if config.device_pool.base_url.trim().is_empty() {
        info!("Device pool not configured, downstream sync disabled");
        Arc::new(DisabledSync)
    } else {
        let client = DevicePoolClient::from_config(&config.device_pool)
            .context("Failed to initialize device pool client")?;
        info!(url = %config.device_pool.base_url, "Device pool sync enabled");
        Arc::new(client)
    };

    let keeper = ConnectionKeeper::builder(directory.clone(), directory)
        .config(&config)
        .dialer(Arc::new(WsDialer::new(config.connection.connect_timeout())))
        .sync(sync)
        .scheduler(Scheduler::new(pool_size))
        .build();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    keeper.run(shutdown).await;
    info!("Device Keeper stopped");
    Ok(())
}

async fn show_targets(config: &Config) -> Result<()> {
    let directory = directory_client(config)?;
    let targets = directory
        .online_targets()
        .await
        .context("Failed to query online devices")?;

    println!("Online devices: {}", targets.len());
    for target in &targets {
        println!();
        println!(
            "  {} ({}, agent {}:{})",
            target.device_id, target.platform, target.host, target.port
        );
        for channel in Channel::ALL {
            println!("    {:<8} {}", channel.as_str(), agent_url(target, channel));
        }
    }

    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    println!("Configuration OK: {}", path.display());
    println!("  Worker threads: {}", config.scheduler.pool_size());
    println!(
        "  Retry budget:   {}",
        config
            .retry
            .budget()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string())
    );
    println!();
    print!("{}", config.to_toml()?);
    Ok(())
}

fn show_version() {
    println!("device-keeper {}", env!("CARGO_PKG_VERSION"));
    println!("Connection keeper for device-hosting agents");
    println!();
    println!("Features:");
    println!("  - One WebSocket per device and channel (main, terminal, screen)");
    println!("  - Reconnection with jittered exponential backoff");
    println!("  - Forwarding address recovery from agent reports");
    println!("  - Downstream device pool registration and heartbeats");
}
