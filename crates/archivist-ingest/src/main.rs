//! Archivist ingestion daemon.
//!
//! Logs in as an existing Matrix account, crawls the history of every joined
//! room once and then follows new messages, keeping a search index current.
//!
//! # Usage
//!
//! ```bash
//! # In-memory index (development)
//! archivist-ingest \
//!     --homeserver-url https://matrix.example.org \
//!     --access-token syt_...
//!
//! # Meilisearch index, live sync only
//! HOMESERVER_URL=https://matrix.example.org \
//! ACCESS_TOKEN=syt_... \
//! MEILISEARCH_HOST=http://localhost:7700 \
//! MEILISEARCH_MASTER_KEY=... \
//! archivist-ingest --no-backfill
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) or SIGTERM:
//! 1. Live sync finishes its current poll and stops
//! 2. Backfill stops between pages; unfinished rooms restart next run
//! 3. In-flight index tasks are drained
//! 4. Exits cleanly

use anyhow::{Context, Result};
use archivist_core::metrics::{start_metrics_server, try_init_metrics};
use archivist_ingest::{
    Backfill, BackfillConfig, BackfillStore, Coordinator, CoordinatorConfig, CryptoOrchestrator,
    CursorStore, HomeserverApi, HomeserverClient, LiveSync, LiveSyncConfig, MeilisearchConfig,
    CryptoEngine, MeilisearchStorage, MemoryStorage, NullCryptoEngine, OlmEngine, SearchStorage,
    Transport, TransportConfig,
};
use clap::Parser;
use metrics::gauge;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Archivist ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "archivist-ingest")]
#[command(about = "Matrix message archive and search indexer")]
#[command(version)]
struct Args {
    /// Homeserver base URL
    #[arg(long, env = "HOMESERVER_URL")]
    homeserver_url: String,

    /// Access token of the account to index as
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// Directory for checkpoints, the crypto store and the in-memory index snapshot
    #[arg(long, default_value = "./storage")]
    storage_dir: PathBuf,

    /// Meilisearch URL (in-memory index if unset)
    #[arg(long, env = "MEILISEARCH_HOST")]
    meilisearch_url: Option<String>,

    /// Meilisearch API key
    #[arg(long, env = "MEILISEARCH_MASTER_KEY", hide_env_values = true)]
    meilisearch_key: Option<String>,

    /// Meilisearch index uid
    #[arg(long, default_value = "messages")]
    index: String,

    /// Prefix of the bot's own command messages
    #[arg(long, default_value = "!archivist")]
    command_prefix: String,

    /// Skip the history crawl
    #[arg(long)]
    no_backfill: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,

    /// Server-side wait of each long-poll, in milliseconds
    #[arg(long, default_value = "30000")]
    poll_timeout_ms: u64,

    /// Run without a crypto engine (encrypted messages stay unindexed)
    #[arg(long)]
    no_encryption: bool,

    /// Passphrase protecting the crypto store
    #[arg(long, env = "CRYPTO_STORE_PASSPHRASE", hide_env_values = true)]
    crypto_store_passphrase: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("archivist_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Archivist ingestion daemon starting...");

    if args.metrics_port > 0 {
        let metrics_handle =
            try_init_metrics().context("Prometheus recorder already installed")?;
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
        gauge!("ingestion_running").set(1.0);
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Homeserver
    let poll_timeout = Duration::from_millis(args.poll_timeout_ms);
    let mut transport_config = TransportConfig::new(&args.homeserver_url, &args.access_token);
    transport_config.long_timeout = transport_config
        .long_timeout
        .max(poll_timeout + Duration::from_secs(30));
    let transport = Transport::new(transport_config).context("Invalid homeserver configuration")?;
    let api: Arc<dyn HomeserverApi> = Arc::new(HomeserverClient::new(transport));

    let whoami = api
        .whoami()
        .await
        .context("Failed to authenticate with the homeserver")?;

    std::fs::create_dir_all(&args.storage_dir).with_context(|| {
        format!(
            "Failed to create storage directory {}",
            args.storage_dir.display()
        )
    })?;

    // Search storage
    let storage = init_storage(&args).await?;

    // Encryption
    let engine = init_crypto(&args, &whoami.user_id, whoami.device_id.as_deref()).await?;
    let crypto = Arc::new(CryptoOrchestrator::new(engine, api.clone()));

    // Checkpoints
    let cursor_store = CursorStore::new(&args.storage_dir);
    let backfill_store = BackfillStore::new(&args.storage_dir);

    tracing::info!("Configuration:");
    tracing::info!("  Homeserver: {}", args.homeserver_url);
    tracing::info!(
        "  Account: {} (device {})",
        whoami.user_id,
        whoami.device_id.as_deref().unwrap_or("unknown")
    );
    tracing::info!("  Storage dir: {}", args.storage_dir.display());
    tracing::info!(
        "  Search: {}",
        args.meilisearch_url.as_deref().unwrap_or("in-memory")
    );
    tracing::info!("  Backfill: {}", !args.no_backfill);
    tracing::info!("  Encryption: {}", crypto.decrypts());

    let live = LiveSync::new(
        api.clone(),
        crypto.clone(),
        cursor_store,
        LiveSyncConfig {
            poll_timeout,
            ..Default::default()
        },
        Arc::clone(&running),
    );

    let backfill = (!args.no_backfill).then(|| {
        Backfill::new(
            api.clone(),
            crypto.clone(),
            backfill_store,
            BackfillConfig::default(),
            Arc::clone(&running),
        )
    });

    let coordinator = Coordinator::new(
        api.clone(),
        storage,
        whoami.user_id.clone(),
        CoordinatorConfig {
            command_prefix: args.command_prefix.clone(),
            ..Default::default()
        },
    );

    tracing::info!("Starting ingestion...");
    let result = coordinator.run(&live, backfill.as_ref()).await;

    gauge!("ingestion_running").set(0.0);

    let (live_stats, backfill_stats) = result.context("Ingestion stopped on a fatal error")?;

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Sync polls:           {}", live_stats.polls);
    tracing::info!("Sync poll errors:     {}", live_stats.poll_errors);
    tracing::info!("Duplicate pages:      {}", live_stats.duplicate_pages);
    tracing::info!("Live events:          {}", live_stats.events_dispatched);
    tracing::info!(
        "Last sync token:      {}",
        live_stats.last_token.as_deref().unwrap_or("none")
    );
    if let Some(stats) = backfill_stats {
        tracing::info!(
            "Backfill rooms:       {} completed, {} skipped, {} failed of {}",
            stats.rooms_completed,
            stats.rooms_skipped,
            stats.rooms_failed,
            stats.rooms_total
        );
        tracing::info!("Backfill deferred:    {}", stats.rooms_deferred);
        tracing::info!("Backfill events:      {}", stats.events_dispatched);
    }
    tracing::info!(
        "Index tasks:          {} spawned, {} failed",
        coordinator.supervisor().spawned(),
        coordinator.supervisor().failures()
    );

    Ok(())
}

/// Connect to Meilisearch if configured, otherwise index in memory with a
/// snapshot next to the checkpoints.
async fn init_storage(args: &Args) -> Result<Arc<dyn SearchStorage>> {
    let Some(url) = &args.meilisearch_url else {
        let path = args.storage_dir.join("index.json");
        tracing::warn!(
            "No Meilisearch URL configured; using in-memory index saved to {}",
            path.display()
        );
        let storage = MemoryStorage::open(&path)
            .with_context(|| format!("Failed to load index snapshot {}", path.display()))?;
        return Ok(Arc::new(storage));
    };

    let config = MeilisearchConfig {
        api_key: args.meilisearch_key.clone(),
        index: args.index.clone(),
        ..MeilisearchConfig::new(url)
    };
    let storage = MeilisearchStorage::new(config).context("Invalid Meilisearch configuration")?;
    storage
        .ensure_index()
        .await
        .with_context(|| format!("Failed to prepare Meilisearch index '{}'", args.index))?;

    Ok(Arc::new(storage))
}

/// Open the Olm machine's store under the storage directory, unless disabled.
async fn init_crypto(
    args: &Args,
    user_id: &str,
    device_id: Option<&str>,
) -> Result<Arc<dyn CryptoEngine>> {
    if args.no_encryption {
        tracing::warn!("Encryption disabled; encrypted messages will not be indexed");
        return Ok(Arc::new(NullCryptoEngine));
    }

    let device_id = device_id.context(
        "Homeserver did not report a device id for this token; log in with a device or pass --no-encryption",
    )?;
    let store_dir = args.storage_dir.join("crypto");
    let engine = OlmEngine::open(
        user_id,
        device_id,
        &store_dir,
        args.crypto_store_passphrase.as_deref(),
    )
    .await
    .with_context(|| format!("Failed to open crypto store {}", store_dir.display()))?;

    Ok(Arc::new(engine))
}
