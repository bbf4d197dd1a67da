use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use packet_relayer::store::sync::OPEN_ENDED;
use packet_relayer::{RelayStore, Relayer, RelayerConfig, StandaloneNode};

#[derive(Parser)]
#[command(name = "relayer")]
#[command(about = "IBC packet relayer for Cosmos chains")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/relayer.toml")]
    pub config: String,

    /// Log level, overrides the configured one
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start syncing and relaying
    Start,
    /// Show sync progress and pending work from the relay store
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RelayerConfig::load(&cli.config)?;
    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.global.log_level.clone());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("packet_relayer={},relayer={}", log_level, log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Loaded configuration from: {}", cli.config);

    match cli.command {
        Commands::Start => start_relayer(config).await?,
        Commands::Status => show_status(&config).await?,
    }

    Ok(())
}

async fn start_relayer(config: RelayerConfig) -> anyhow::Result<()> {
    info!(
        "Starting relayer for {} chains and {} connections",
        config.chains.len(),
        config.connections.len()
    );
    let relayer = Relayer::new(config, Arc::new(StandaloneNode)).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = stop_tx.send(true);
    });

    let outcome = relayer.run(stop_rx).await;
    relayer.close().await;
    outcome?;
    Ok(())
}

async fn show_status(config: &RelayerConfig) -> anyhow::Result<()> {
    let store = RelayStore::open_read_only(&config.global.database_path).await?;
    let status = store.status().await?;

    println!("Schema version: {}", status.schema_version);
    println!("Sync ranges:");
    for range in &status.ranges {
        let end = if range.end_height == OPEN_ENDED {
            "live".to_string()
        } else {
            range.end_height.to_string()
        };
        println!(
            "  {:<20} {:>10} .. {:<10} synced {}",
            range.chain_id, range.start_height, end, range.synced_height
        );
    }
    println!("Pending work:");
    if status.pending.is_empty() {
        println!("  none");
    }
    for pending in &status.pending {
        println!(
            "  {:<20} {:<16} {}",
            pending.chain_id, pending.kind, pending.count
        );
    }

    store.close().await;
    Ok(())
}
