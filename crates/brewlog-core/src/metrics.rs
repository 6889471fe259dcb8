//! Prometheus metrics helpers for brewlog.
//!
//! # Usage
//!
//! ```rust,ignore
//! use brewlog_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9090, handle, health_reporter).await?;
//!
//! metrics::counter!("stream_frames_total").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`stream_`, `index_`, `backfill_`, `automod_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: sparingly, bounded cardinality only (record kind, reason)

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Health snapshot served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `ok`, `degraded` or `disconnected`.
    pub status: &'static str,
    /// Last persisted stream cursor.
    pub cursor: Option<u64>,
    /// Consecutive connection or protocol failures.
    pub consecutive_failures: u64,
    pub version: &'static str,
}

impl HealthReport {
    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Callback producing the current health snapshot.
pub type HealthReporter = Arc<dyn Fn() -> HealthReport + Send + Sync>;

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the metrics HTTP server in the background.
///
/// Serves `/metrics` (Prometheus text format) and `/health` (JSON; 503 when
/// the stream is degraded or disconnected).
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
    health: HealthReporter,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .route(
            "/health",
            get(move || {
                let health = Arc::clone(&health);
                async move {
                    let report = health();
                    let status = if report.is_ok() {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    (status, Json(report))
                }
            }),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics used across brewlog.
fn register_common_metrics() {
    // =========================================================================
    // Stream Consumer
    // =========================================================================

    describe_counter!("stream_frames_total", "Frames received from the event log");
    describe_counter!(
        "stream_frames_malformed_total",
        "Frames dropped because they could not be parsed"
    );
    describe_counter!(
        "stream_events_applied_total",
        "Events applied to the index (label: kind)"
    );
    describe_counter!(
        "stream_events_rejected_total",
        "Events dropped because their record failed to decode"
    );
    describe_counter!(
        "stream_apply_retries_total",
        "Apply attempts retried after a transient failure"
    );
    describe_counter!("stream_reconnects_total", "Reconnection attempts");
    describe_gauge!("stream_connected", "Whether the stream is connected (1=yes)");
    describe_gauge!("stream_degraded", "Whether stream health is degraded (1=yes)");
    describe_gauge!("stream_cursor", "Last persisted stream cursor (time_us)");

    // =========================================================================
    // Derived Index
    // =========================================================================

    describe_counter!("index_likes_total", "Like upserts that created a new like");
    describe_counter!("index_comments_total", "Comment upserts that created a comment");
    describe_counter!(
        "index_notifications_total",
        "Notifications created (label: kind)"
    );
    describe_counter!(
        "index_record_fetches_total",
        "Remote record fetches on cache miss"
    );
    describe_counter!(
        "index_profile_fetches_total",
        "Remote profile fetches on cache miss"
    );
    describe_histogram!(
        "index_feed_query_duration_seconds",
        "Time spent building feed pages"
    );

    // =========================================================================
    // Backfill
    // =========================================================================

    describe_counter!("backfill_authors_total", "Authors backfilled to completion");
    describe_counter!("backfill_records_total", "Records applied during backfill");
    describe_counter!("backfill_failures_total", "Backfill attempts that failed");
    describe_gauge!("backfill_running", "Backfills currently in flight");

    // =========================================================================
    // Automod
    // =========================================================================

    describe_counter!("automod_reports_total", "Reports accepted");
    describe_counter!(
        "automod_reports_rejected_total",
        "Reports rejected by policy (label: reason)"
    );
    describe_counter!("automod_auto_hides_total", "Records hidden automatically");
    describe_counter!(
        "automod_moderator_actions_total",
        "Moderator hide/unhide/dismiss actions (label: action)"
    );
}
