//! Prometheus metrics helpers for archivist.
//!
//! # Usage
//!
//! ```rust,ignore
//! use archivist_core::metrics::{start_metrics_server, try_init_metrics};
//!
//! #[tokio::main]
//! async fn main() {
//!     if let Some(handle) = try_init_metrics() {
//!         start_metrics_server(9090, handle).await.unwrap();
//!     }
//!
//!     metrics::counter!("sync_polls_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`sync_`, `backfill_`, `crypto_`, `index_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used sparingly (request kind, outcome)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and describe the daemon's metrics.
///
/// Returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves `/metrics` on the given port from a background task and returns
/// once the listener is bound.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics emitted by the ingestion daemon.
fn register_common_metrics() {
    describe_gauge!("ingestion_running", "Whether the daemon is running (1=yes, 0=no)");

    // =========================================================================
    // Live Sync
    // =========================================================================

    describe_counter!("sync_polls_total", "Long-poll requests issued");
    describe_counter!("sync_poll_errors_total", "Long-poll requests that failed");
    describe_counter!(
        "sync_duplicate_pages_total",
        "Sync responses skipped because their token was already processed"
    );
    describe_counter!("sync_events_total", "Timeline events dispatched from live sync");
    describe_gauge!("sync_running", "Whether the live sync loop is running (1=yes, 0=no)");

    // =========================================================================
    // Backfill
    // =========================================================================

    describe_counter!("backfill_pages_total", "History pages fetched");
    describe_counter!("backfill_page_retries_total", "History page fetch retries");
    describe_counter!("backfill_events_total", "History events dispatched");
    describe_counter!(
        "backfill_edits_skipped_total",
        "History events skipped because a later edit superseded them"
    );
    describe_counter!("backfill_rooms_completed_total", "Rooms fully backfilled");
    describe_counter!("backfill_rooms_failed_total", "Rooms whose backfill was abandoned");
    describe_gauge!("backfill_running", "Whether a backfill run is in progress (1=yes, 0=no)");

    // =========================================================================
    // Crypto
    // =========================================================================

    describe_counter!("crypto_decrypt_failures_total", "Events that could not be decrypted");
    describe_counter!(
        "crypto_requests_sent_total",
        "Outgoing crypto requests delivered (label: kind)"
    );
    describe_counter!(
        "crypto_requests_failed_total",
        "Outgoing crypto requests that failed and will be retried next sync"
    );
    describe_counter!(
        "crypto_requests_dropped_total",
        "Outgoing crypto requests of unknown type"
    );

    // =========================================================================
    // Indexing
    // =========================================================================

    describe_counter!("index_documents_upserted_total", "Documents written to search storage");
    describe_counter!("index_documents_deleted_total", "Documents removed because of edits");
    describe_counter!("index_task_failures_total", "Index tasks that returned an error");
    describe_counter!("commands_handled_total", "Bot commands intercepted");
    describe_histogram!("index_task_duration_seconds", "Time spent per index task");
}
