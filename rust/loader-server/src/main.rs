//! Shard Loader Service
//!
//! Serves shuffled batches of dataset samples to training clients over
//! gRPC. Each client session gets its own reproducible, memory-bounded
//! shuffle over an immutable snapshot of the dataset's shard files.
//!
//! # Usage
//!
//! ```bash
//! # Serve one dataset with default settings
//! shardloader-server --dataset libritts=/data/libritts
//!
//! # Start with custom port
//! shardloader-server --port 50052 --dataset libritts=/data/libritts
//!
//! # Force a record format instead of picking it by extension
//! shardloader-server --dataset tokens:length-prefixed=/data/tokens
//!
//! # Start with configuration file
//! shardloader-server --config shardloader.toml
//! ```

mod proto {
    tonic::include_proto!("shardloader.v1");
}

mod service;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loader_core::config::{DatasetConfig, LoaderConfig};
use proto::shard_loader_server::ShardLoaderServer;
use service::ShardLoaderService;
use state::ServerState;

/// Shard Loader dataset server
#[derive(Parser, Debug)]
#[command(name = "shardloader-server")]
#[command(about = "Streams shuffled dataset batches to training clients")]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to (overrides the config file)
    #[arg(short, long)]
    address: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset to serve, as ID=PATH or ID:FORMAT=PATH (repeatable)
    #[arg(long = "dataset", value_name = "ID[:FORMAT]=PATH")]
    datasets: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> loader_core::Result<LoaderConfig> {
    let config = match &args.config {
        Some(path) => LoaderConfig::from_file(path)?,
        None => LoaderConfig::default(),
    };
    let mut config = config.with_env_overrides();

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(address) = &args.address {
        config.server.address = address.clone();
    }
    for pair in &args.datasets {
        config.datasets.push(DatasetConfig::parse_pair(pair)?);
    }

    config.validate()?;
    if config.datasets.is_empty() {
        return Err(loader_core::LoaderError::config(
            "no datasets configured; pass --dataset ID=PATH or a [[datasets]] table",
        ));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;

    tracing::info!("Starting shard loader");
    tracing::info!("  Datasets: {}", config.datasets.len());
    tracing::info!("  Read timeout: {}ms", config.storage.read_timeout_ms);
    tracing::info!("  Read parallelism: {}", config.storage.read_parallelism);
    tracing::info!("  Default buffer capacity: {}", config.shuffle.default_buffer_capacity);
    tracing::info!("  Session idle TTL: {}s", config.session.idle_ttl_secs);

    let addr: SocketAddr = format!("{}:{}", config.server.address, config.server.port).parse()?;
    let max_message_bytes = config.server.max_message_bytes;
    let reap_interval = config.session.reap_interval();
    let rescan_interval = config.catalog.rescan_interval_secs;

    let state = Arc::new(tokio::task::spawn_blocking(move || ServerState::new(config)).await??);
    let service = ShardLoaderService::new(Arc::clone(&state));

    tracing::info!("Listening on {}", addr);

    // Session reaper
    let reaper_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_interval);
        loop {
            interval.tick().await;
            reaper_state.sessions.reap().await;
        }
    });

    // Periodic rescan
    if rescan_interval > 0 {
        let rescan_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(rescan_interval));
            // The first tick fires immediately and the startup scan just ran
            interval.tick().await;
            loop {
                interval.tick().await;
                rescan_state.rescan_all().await;
            }
        });
    }

    Server::builder()
        .add_service(
            ShardLoaderServer::new(service)
                .max_decoding_message_size(max_message_bytes)
                .max_encoding_message_size(max_message_bytes),
        )
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down shard loader...");
        })
        .await?;

    Ok(())
}
