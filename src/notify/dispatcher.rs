//! Dispatcher: drains the notification queue to subscribers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::{AlertBatch, AlertEvent, NotificationQueue};
use crate::subscribers::{Subscriber, SubscriberRegistry};

/// Default dispatch interval.
pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_secs(1);

/// What one dispatch cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Events popped from the queue.
    pub popped: usize,
    /// Successful sends (one per subscriber).
    pub deliveries: usize,
    /// Failed sends (one per subscriber).
    pub failures: usize,
    /// Events pushed back at the tail.
    pub requeued: usize,
    /// Subscribers skipped because their channel was no longer open.
    pub skipped_closed: usize,
}

/// Flushes queued events to matching subscribers on a fixed cadence.
///
/// Per cycle:
/// 1. take a snapshot of the registry
/// 2. pop up to `batch_size` events
/// 3. for each subscriber, send its matching subset as one [`AlertBatch`]
///    (all subscribers in parallel)
/// 4. push the events of failed sends back at the queue tail, each at most
///    once per cycle
///
/// The dispatcher never removes subscribers.
pub struct Dispatcher {
    queue: NotificationQueue,
    registry: SubscriberRegistry,
    batch_size: usize,
    interval: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: NotificationQueue,
        registry: SubscriberRegistry,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            batch_size: batch_size.max(1),
            interval,
        }
    }

    /// Run one dispatch cycle.
    pub async fn dispatch_once(&self) -> DispatchReport {
        let subscribers = self.registry.snapshot();
        let events = self.queue.pop_batch(self.batch_size);
        if events.is_empty() {
            return DispatchReport::default();
        }

        let mut report = DispatchReport {
            popped: events.len(),
            ..DispatchReport::default()
        };

        let mut sends = Vec::new();
        for subscriber in &subscribers {
            let matching: Vec<AlertEvent> = events
                .iter()
                .filter(|e| subscriber.filter.matches(e))
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }
            if !subscriber.channel.is_open() {
                tracing::debug!(subscriber_id = %subscriber.id, "Channel not open, skipping");
                report.skipped_closed += 1;
                continue;
            }
            sends.push(send_to(subscriber.clone(), AlertBatch::new(matching)));
        }

        let results = join_all(sends).await;

        let mut failed_ids: HashSet<Uuid> = HashSet::new();
        for (subscriber_id, batch, result) in results {
            match result {
                Ok(()) => {
                    report.deliveries += 1;
                    tracing::debug!(
                        subscriber_id = %subscriber_id,
                        batch_size = batch.len(),
                        "Batch delivered"
                    );
                    metrics::counter!("alertd_alerts_delivered_total", "subscriber" => subscriber_id)
                        .increment(batch.len() as u64);
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(
                        subscriber_id = %subscriber_id,
                        batch_size = batch.len(),
                        error = %e,
                        "Batch delivery failed, requeueing"
                    );
                    metrics::counter!("alertd_delivery_failures_total", "subscriber" => subscriber_id)
                        .increment(1);
                    failed_ids.extend(batch.alerts.iter().map(|a| a.id));
                }
            }
        }

        if !failed_ids.is_empty() {
            // Pop order, each event once.
            let requeue: Vec<AlertEvent> = events
                .into_iter()
                .filter(|e| failed_ids.contains(&e.id))
                .collect();
            report.requeued = requeue.len();
            metrics::counter!("alertd_alerts_requeued_total").increment(requeue.len() as u64);
            self.queue.push_all(requeue);
        }

        tracing::debug!(
            popped = report.popped,
            subscribers = subscribers.len(),
            deliveries = report.deliveries,
            failures = report.failures,
            requeued = report.requeued,
            "Dispatch cycle complete"
        );

        report
    }

    /// Dispatch on every tick until cancelled.
    ///
    /// A cycle in progress always completes, so no batch is left half sent.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch_once()
                        .instrument(tracing::debug_span!("dispatch_cycle"))
                        .await;
                }
            }
        }

        tracing::info!("Dispatcher stopped");
    }
}

async fn send_to(
    subscriber: Arc<Subscriber>,
    batch: AlertBatch,
) -> (String, AlertBatch, Result<(), crate::error::DeliveryError>) {
    let result = subscriber.channel.send(&batch).await;
    (subscriber.id.clone(), batch, result)
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("batch_size", &self.batch_size)
            .field("interval", &self.interval)
            .field("queue_len", &self.queue.len())
            .finish()
    }
}
