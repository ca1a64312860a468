//! Prometheus metrics exposition server.
//!
//! This module provides an HTTP server that exposes alertd metrics
//! in Prometheus format on a configurable port.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Set once the global recorder is installed.
static RECORDER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Register all metric descriptions for Prometheus.
///
/// Descriptions provide HELP text in the Prometheus output.
pub fn register_metric_descriptions() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Evaluation
    describe_counter!(
        "alertd_evaluation_cycles_total",
        "Total number of evaluation cycles started"
    );
    describe_counter!(
        "alertd_evaluation_failures_total",
        "Total number of evaluation cycles aborted because the metric snapshot could not be read"
    );
    describe_counter!(
        "alertd_exposition_lines_skipped_total",
        "Total number of malformed exposition lines skipped while parsing a scrape"
    );
    describe_counter!(
        "alertd_alerts_fired_total",
        "Total number of alerts forwarded to the notification queue"
    );
    describe_counter!(
        "alertd_alerts_suppressed_total",
        "Total number of breaches suppressed by the cooldown"
    );
    describe_counter!(
        "alertd_alerts_resolved_total",
        "Total number of firing rules that returned to normal"
    );

    // Delivery
    describe_counter!(
        "alertd_alerts_delivered_total",
        "Total number of alerts delivered to subscribers"
    );
    describe_counter!(
        "alertd_delivery_failures_total",
        "Total number of failed batch sends"
    );
    describe_counter!(
        "alertd_alerts_requeued_total",
        "Total number of alerts pushed back to the queue after a failed send"
    );
    describe_counter!(
        "alertd_alerts_dropped_total",
        "Total number of alerts evicted from a full queue"
    );
    describe_counter!(
        "alertd_task_panics_total",
        "Total number of pipeline task panics"
    );

    // Gauges
    describe_gauge!(
        "alertd_queue_size",
        "Current number of alerts in the notification queue"
    );
    describe_gauge!(
        "alertd_subscribers_connected",
        "Current number of registered subscribers"
    );
    describe_gauge!(
        "alertd_build_info",
        "Build information with version label (always 1)"
    );

    // Histograms
    describe_histogram!(
        "alertd_evaluation_duration_seconds",
        "Duration of one evaluation cycle, snapshot read included"
    );
}

/// Metrics server for Prometheus exposition on `/metrics`.
pub struct MetricsServer {
    port: u16,
    /// Signalled once the recorder is installed, so callers can wait before
    /// emitting metrics that would otherwise be lost.
    ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsServer {
    /// Create a new metrics server bound to the given port.
    ///
    /// Use port 0 to let the OS assign an available port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ready_tx: None,
        }
    }

    /// Create a new metrics server with a ready signal channel.
    pub fn with_ready_signal(port: u16, ready_tx: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            port,
            ready_tx: Some(ready_tx),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Install the global recorder and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be installed (port in use, or
    /// a recorder already installed in this process).
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

        let _ = RECORDER_INSTALLED.set(());

        register_metric_descriptions();

        if let Some(tx) = self.ready_tx {
            let _ = tx.send(());
        }

        info!(port = self.port, "Metrics server started on /metrics");

        cancel.cancelled().await;

        info!("Metrics server shutting down");

        Ok(())
    }
}

/// Check if the metrics recorder has been installed.
pub fn is_recorder_installed() -> bool {
    RECORDER_INSTALLED.get().is_some()
}

/// Initialize known metrics so they are visible from startup.
///
/// # Arguments
///
/// * `rule_ids` - Rule ids to initialize per-rule counters
/// * `subscriber_ids` - Static subscriber ids to initialize per-subscriber counters
pub fn initialize_metrics(rule_ids: &[&str], subscriber_ids: &[&str]) {
    use metrics::{counter, gauge};

    gauge!("alertd_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    gauge!("alertd_queue_size").set(0.0);
    gauge!("alertd_subscribers_connected").set(subscriber_ids.len() as f64);

    counter!("alertd_evaluation_cycles_total").absolute(0);
    counter!("alertd_evaluation_failures_total").absolute(0);
    counter!("alertd_alerts_requeued_total").absolute(0);
    counter!("alertd_alerts_dropped_total").absolute(0);

    for rule_id in rule_ids {
        counter!("alertd_alerts_fired_total", "rule_id" => rule_id.to_string()).absolute(0);
        counter!("alertd_alerts_suppressed_total", "rule_id" => rule_id.to_string()).absolute(0);
        counter!("alertd_alerts_resolved_total", "rule_id" => rule_id.to_string()).absolute(0);
    }

    for subscriber_id in subscriber_ids {
        counter!("alertd_alerts_delivered_total", "subscriber" => subscriber_id.to_string())
            .absolute(0);
        counter!("alertd_delivery_failures_total", "subscriber" => subscriber_id.to_string())
            .absolute(0);
    }

    tracing::info!(
        rule_count = rule_ids.len(),
        subscriber_count = subscriber_ids.len(),
        "Metrics initialized to zero"
    );
}
