//! Periodic rule evaluation.
//!
//! Each cycle reads one metric snapshot, then for every registered rule:
//!
//! - metric absent: skip the rule (no state change)
//! - comparator true: build an [`AlertEvent`] and hand it to the deduplicator
//! - comparator false: resolve the rule if it was firing
//!
//! A snapshot read failure aborts the whole cycle before any state is
//! touched; the next tick retries independently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::dedup::{Admission, Deduplicator};
use crate::error::SnapshotError;
use crate::notify::AlertEvent;
use crate::rules::RuleRegistry;
use crate::snapshot::MetricSource;
use crate::template::MessageRenderer;

/// Default evaluation interval.
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(30);

/// What one evaluation cycle did, by rule id.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub fired: Vec<String>,
    pub suppressed: Vec<String>,
    pub resolved: Vec<String>,
    /// Rules whose metric was absent from the snapshot.
    pub absent: Vec<String>,
}

/// Reconciles live metric values against the rule registry.
pub struct AlertEvaluator {
    rules: Arc<RuleRegistry>,
    source: Arc<dyn MetricSource>,
    dedup: Arc<Deduplicator>,
    renderer: MessageRenderer,
    interval: Duration,
}

impl AlertEvaluator {
    pub fn new(
        rules: Arc<RuleRegistry>,
        source: Arc<dyn MetricSource>,
        dedup: Arc<Deduplicator>,
        interval: Duration,
    ) -> Self {
        Self {
            rules,
            source,
            dedup,
            renderer: MessageRenderer::new(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one cycle stamped with the current wall-clock time.
    pub async fn evaluate_once(&self) -> Result<CycleReport, SnapshotError> {
        self.evaluate_at(Utc::now()).await
    }

    /// Run one cycle stamped with `now`.
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> Result<CycleReport, SnapshotError> {
        let started = Instant::now();
        metrics::counter!("alertd_evaluation_cycles_total").increment(1);

        let snapshot = match self.source.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                metrics::counter!("alertd_evaluation_failures_total").increment(1);
                return Err(e);
            }
        };

        let mut report = CycleReport::default();
        for rule in self.rules.iter() {
            let Some(value) = snapshot.value(&rule.metric) else {
                tracing::trace!(rule_id = %rule.id, metric = %rule.metric, "Metric absent, skipping rule");
                report.absent.push(rule.id.clone());
                continue;
            };

            if rule.breached(value) {
                let message = self.renderer.render_with_fallback(rule, value);
                let event = AlertEvent::new(rule, value, message, now);
                match self.dedup.admit(event, now) {
                    Admission::Forwarded => report.fired.push(rule.id.clone()),
                    Admission::Suppressed { .. } => report.suppressed.push(rule.id.clone()),
                }
            } else if self.dedup.resolve(&rule.id) {
                report.resolved.push(rule.id.clone());
            }
        }

        metrics::histogram!("alertd_evaluation_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(
            series = snapshot.len(),
            fired = report.fired.len(),
            suppressed = report.suppressed.len(),
            resolved = report.resolved.len(),
            absent = report.absent.len(),
            "Evaluation cycle complete"
        );

        Ok(report)
    }

    /// Evaluate on every tick until cancelled.
    ///
    /// Cancellation is only observed between cycles: a cycle in progress
    /// always completes.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs_f64(),
            rules = self.rules.len(),
            source = %self.source.name(),
            "Alert evaluator started"
        );

        // Cycles are stamped from the scheduled tick, not from when the task
        // got to run, so consecutive cycles are exactly one interval apart.
        let origin = tokio::time::Instant::now();
        let wall_origin = Utc::now();
        let mut ticker = tokio::time::interval_at(origin, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                deadline = ticker.tick() => {
                    let now = scheduled_time(wall_origin, origin, deadline);
                    let span = tracing::info_span!("evaluation_cycle", %now);
                    if let Err(e) = self.evaluate_at(now).instrument(span).await {
                        tracing::warn!(error = %e, "Evaluation cycle aborted, retrying next interval");
                    }
                }
            }
        }

        tracing::info!("Alert evaluator stopped");
    }
}

/// Wall-clock time of a tick scheduled at `deadline`.
fn scheduled_time(
    wall_origin: DateTime<Utc>,
    origin: tokio::time::Instant,
    deadline: tokio::time::Instant,
) -> DateTime<Utc> {
    let offset = chrono::Duration::from_std(deadline.duration_since(origin))
        .unwrap_or_else(|_| chrono::Duration::zero());
    wall_origin + offset
}

impl std::fmt::Debug for AlertEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEvaluator")
            .field("rule_count", &self.rules.len())
            .field("source", &self.source.name())
            .field("interval", &self.interval)
            .finish()
    }
}
