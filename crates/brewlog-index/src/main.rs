//! Brewlog indexer daemon.
//!
//! Backfills the configured known authors, then follows the Jetstream event
//! stream into the derived index until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Defaults for local development
//! brewlog-indexer
//!
//! # Configuration comes from BREWLOG_* environment variables, optionally
//! # loaded from a dotenv file
//! brewlog-indexer --dotenv /etc/brewlog/indexer.env
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) or SIGTERM the daemon:
//! 1. Stops reading from the stream
//! 2. Writes the last cursor durably and flushes the store
//! 3. Logs a summary and exits

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use brewlog_core::metrics::{init_metrics, start_metrics_server};
use brewlog_index::{
    AutomodEngine, BackfillCoordinator, Config, ConsumerConfig, DerivedIndex, JetstreamSource,
    Store, StreamConsumer, XrpcClient,
};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Brewlog indexer daemon.
#[derive(Parser, Debug)]
#[command(name = "brewlog-indexer")]
#[command(about = "Real-time record indexer and automod engine for brewlog")]
#[command(version)]
struct Args {
    /// Path to a .env file loaded before reading configuration
    #[arg(long, default_value = ".env")]
    dotenv: String,

    /// Skip the startup backfill of known authors
    #[arg(long, env = "BREWLOG_SKIP_BACKFILL")]
    skip_backfill: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,brewlog_index=debug")),
        )
        .init();

    tracing::info!("Brewlog indexer starting...");

    let config = Config::from_env().context("invalid configuration")?;

    let store = Arc::new(
        Store::open(&config.data_dir)
            .with_context(|| format!("failed to open store at {}", config.data_dir.display()))?,
    );
    let client = Arc::new(
        XrpcClient::new(config.pds_url.clone(), config.appview_url.clone())
            .context("failed to build repository client")?,
    );
    let automod = Arc::new(AutomodEngine::new(store.clone(), config.automod_config()));
    let index = Arc::new(DerivedIndex::new(
        store.clone(),
        client.clone(),
        automod.clone(),
        config.index_config(),
    ));
    let coordinator = BackfillCoordinator::new(index.clone(), client.clone());
    let consumer = Arc::new(StreamConsumer::new(
        index.clone(),
        store.clone(),
        ConsumerConfig::default(),
    ));
    let source = JetstreamSource::new(&config.jetstream_url).context("invalid stream url")?;

    if config.metrics_port > 0 {
        let handle = init_metrics();
        let health = consumer.health();
        start_metrics_server(config.metrics_port, handle, Arc::new(move || health.report()))
            .await
            .context("failed to start metrics server")?;
    }

    // Set up graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let handler_tx = Arc::clone(&shutdown_tx);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        let _ = handler_tx.send(true);
    })
    .context("Failed to set Ctrl+C handler")?;

    if !args.skip_backfill && !config.known_authors.is_empty() {
        tracing::info!(
            authors = config.known_authors.len(),
            concurrency = config.backfill_concurrency,
            "backfilling known authors"
        );
        tokio::select! {
            summary = coordinator.backfill_many(config.known_authors.clone(), config.backfill_concurrency) => {
                for (did, error) in &summary.failed {
                    tracing::warn!(did, error, "backfill failed; will retry on next start");
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("Shutdown during backfill");
                return Ok(());
            }
        }
    }

    tracing::info!("Starting stream consumer...");
    let consumer_task = {
        let consumer = Arc::clone(&consumer);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { consumer.run(source, shutdown).await })
    };

    let stats = consumer_task
        .await
        .context("stream consumer task panicked")?
        .context("stream consumer failed")?;

    let index_stats = index.stats().context("failed to read index stats")?;
    tracing::info!("Shutdown complete");
    tracing::info!("  Frames: {}", stats.frames);
    tracing::info!("  Applied: {}", stats.applied);
    tracing::info!("  Rejected: {}", stats.rejected);
    tracing::info!("  Malformed: {}", stats.malformed);
    tracing::info!("  Reconnects: {}", stats.reconnects);
    tracing::info!(
        "  Cursor: {}",
        stats
            .last_cursor
            .map_or_else(|| "none".to_string(), |c| c.to_string())
    );
    tracing::info!(
        "  Index: {} likes, {} comments, {} notifications, {} authors, {} records",
        index_stats.likes,
        index_stats.comments,
        index_stats.notifications,
        index_stats.authors,
        index_stats.records
    );

    Ok(())
}
