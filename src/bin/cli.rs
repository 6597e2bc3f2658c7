//! Feed ingestion CLI
//!
//! Runs the producer or the consumer as a long-lived process. Both stop
//! cleanly on Ctrl-C or SIGTERM.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use feed_ingest::{
    broker::{AmqpConnector, ConnectionManager, RetryPolicy},
    error::Result,
    models::{Config, StorageBackend},
    pipeline::{Consumer, Producer},
    services::HttpFeedFetcher,
    storage::{DedupStore, LocalObjectWriter, ObjectWriter},
};
use tokio_util::sync::CancellationToken;

/// feed-ingest - RSS ingestion pipeline
#[derive(Parser, Debug)]
#[command(
    name = "feed-ingest",
    version,
    about = "RSS/Atom ingestion through a durable stream queue"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll feeds and publish new entries to the queue
    Produce,

    /// Consume the queue and write batch objects
    Consume,

    /// Validate the configuration file
    Validate,

    /// Show configuration summary and dedup state
    Info,
}

/// Initialize logging; `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("Shutdown requested, finishing current work...");
        token.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => log::info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
            }
        }
        Err(e) => {
            log::warn!("Could not register SIGTERM handler: {}. Waiting for Ctrl-C only", e);
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}

async fn object_writer(config: &Config) -> Result<Box<dyn ObjectWriter>> {
    match config.storage.backend {
        StorageBackend::Local => Ok(Box::new(LocalObjectWriter::new(
            &config.storage.local_dir,
            &config.storage.root,
        ))),
        #[cfg(feature = "s3")]
        StorageBackend::S3 => {
            let bucket = config.storage.bucket.clone().unwrap_or_default();
            let writer =
                feed_ingest::storage::S3ObjectWriter::from_env(bucket, &config.storage.root)
                    .await?;
            Ok(Box::new(writer))
        }
        #[cfg(not(feature = "s3"))]
        StorageBackend::S3 => Err(feed_ingest::error::AppError::config(
            "storage.backend = \"s3\" requires building with the `s3` feature",
        )),
    }
}

fn connection_manager(config: &Config, role: &str) -> Result<ConnectionManager<AmqpConnector>> {
    let connector = AmqpConnector::from_config(&config.broker, format!("feed-ingest-{}", role))?;
    Ok(ConnectionManager::new(
        connector,
        RetryPolicy::from_config(&config.broker),
    ))
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = Config::load(&cli.config);
    let level = match (&loaded, cli.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => config.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    init_logging(&level);

    let mut config = match loaded {
        Ok(config) => {
            log::info!("Loaded configuration from {}", cli.config.display());
            config
        }
        Err(e) if matches!(cli.command, Command::Validate) => {
            log::error!("Cannot read {}: {}", cli.config.display(), e);
            return Err(e);
        }
        Err(e) => {
            log::warn!(
                "Config load failed from {}: {}. Using defaults.",
                cli.config.display(),
                e
            );
            Config::default()
        }
    };
    config.apply_env();

    if let Err(e) = config.validate() {
        log::error!("Config validation failed: {}", e);
        return Err(e);
    }

    match cli.command {
        Command::Produce => {
            let manager = connection_manager(&config, "producer")?;
            let fetcher = HttpFeedFetcher::new(&config.producer)?;
            let mut producer = Producer::new(manager, Box::new(fetcher), &config.producer);

            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());
            producer.run(&cancel).await?;
        }

        Command::Consume => {
            let manager = connection_manager(&config, "consumer")?;
            let writer = object_writer(&config).await?;
            let mut consumer = Consumer::new(manager, writer, &config.consumer);

            let cancel = CancellationToken::new();
            spawn_shutdown_listener(cancel.clone());
            consumer.run(&cancel).await?;
        }

        Command::Validate => {
            log::info!(
                "✓ Config OK ({} feeds, queue {})",
                config.producer.feeds.len(),
                config.broker.queue
            );
        }

        Command::Info => {
            log::info!(
                "Broker: {} (queue {}, offset {})",
                config.broker.display_addr(),
                config.broker.queue,
                config.broker.stream_offset
            );
            log::info!(
                "Producer: {} feeds every {}s",
                config.producer.feeds.len(),
                config.producer.poll_interval_secs
            );
            log::info!(
                "Consumer: batches of {} or every {}s, {:?} ack mode",
                config.consumer.batch_size,
                config.consumer.flush_interval_secs,
                config.consumer.ack_mode
            );
            match config.storage.backend {
                StorageBackend::Local => log::info!(
                    "Storage: {}/{}",
                    config.storage.local_dir.display(),
                    config.storage.root
                ),
                StorageBackend::S3 => log::info!(
                    "Storage: s3://{}/{}",
                    config.storage.bucket.as_deref().unwrap_or_default(),
                    config.storage.root
                ),
            }

            let store = DedupStore::new(&config.producer.dedup_file);
            match store.load().await {
                Ok(links) => log::info!(
                    "Dedup store {}: {} processed links",
                    store.path().display(),
                    links.len()
                ),
                Err(e) => log::warn!("Dedup store {} unreadable: {}", store.path().display(), e),
            }
        }
    }

    log::info!("Done!");

    Ok(())
}
