//! End-to-end pipeline scenarios: evaluation through dedup, queue, dispatch
//! and subscriber lifecycle.
//!
//! Cycles are driven by hand (`evaluate_at` / `dispatch_once`) so timestamps
//! are exact. Subscribers always join through a [`RegistryHandle`], as a
//! transport would.

use std::sync::Arc;
use std::time::Duration;

use alertd::notify::MpscChannel;
use alertd::subscribers::RegistryWorker;
use alertd::{
    AlertEvaluator, AlertPipeline, AlertRule, Comparator, Deduplicator, Dispatcher,
    NotificationQueue, PipelineSettings, RegistryHandle, RuleRegistry, Severity,
    StaticMetricSource, SubscriberFilter, SubscriberRegistry,
};
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_secs(30);

fn at_cycle(n: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + n * 30, 0).unwrap()
}

fn cpu_rule() -> AlertRule {
    AlertRule::new("cpu_high", "cpu_pct", Comparator::Gt, 90.0, Severity::Critical)
        .with_name("CPU high")
        .with_label("component", "host")
}

/// Pipeline components with only the registry worker running.
struct Harness {
    source: Arc<StaticMetricSource>,
    queue: NotificationQueue,
    dedup: Arc<Deduplicator>,
    evaluator: AlertEvaluator,
    dispatcher: Dispatcher,
    registry: SubscriberRegistry,
    handle: RegistryHandle,
    _cancel: tokio_util::sync::DropGuard,
}

fn harness(rules: Vec<AlertRule>) -> Harness {
    let source = Arc::new(StaticMetricSource::new());
    let queue = NotificationQueue::unbounded();
    let dedup = Arc::new(Deduplicator::new(INTERVAL, queue.clone()));
    let evaluator = AlertEvaluator::new(
        Arc::new(RuleRegistry::new(rules).unwrap()),
        source.clone(),
        dedup.clone(),
        INTERVAL,
    );
    let registry = SubscriberRegistry::new(None);
    let dispatcher = Dispatcher::new(queue.clone(), registry.clone(), 100, Duration::from_secs(1));
    let (worker, handle) = RegistryWorker::new(registry.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(worker.run(cancel.clone()));

    Harness {
        source,
        queue,
        dedup,
        evaluator,
        dispatcher,
        registry,
        handle,
        _cancel: cancel.drop_guard(),
    }
}

fn pipeline(rules: Vec<AlertRule>) -> (AlertPipeline, Arc<StaticMetricSource>) {
    let source = Arc::new(StaticMetricSource::new());
    let settings = PipelineSettings {
        evaluation_interval: INTERVAL,
        cooldown: INTERVAL,
        ..PipelineSettings::default()
    };
    let pipeline = AlertPipeline::new(RuleRegistry::new(rules).unwrap(), source.clone(), settings);
    (pipeline, source)
}

// ============================================================
// Cooldown scenario
// ============================================================

#[tokio::test]
async fn cpu_sequence_delivers_two_events() {
    let h = harness(vec![cpu_rule()]);
    let (channel, mut rx) = MpscChannel::pair(16);
    h.handle
        .subscribe("ops", Arc::new(channel), SubscriberFilter::all())
        .await
        .unwrap();

    let mut delivered = Vec::new();
    for (cycle, value) in [85.0, 92.0, 93.0, 60.0, 95.0].into_iter().enumerate() {
        let cycle = cycle as i64 + 1;
        h.source.set("cpu_pct", value);
        h.evaluator.evaluate_at(at_cycle(cycle)).await.unwrap();

        if cycle == 3 {
            let state = h.dedup.state("cpu_high").unwrap();
            assert_eq!(state.repeat_count, 1);
            assert_eq!(state.last_triggered, at_cycle(2));
        }

        h.dispatcher.dispatch_once().await;
        while let Ok(batch) = rx.try_recv() {
            delivered.extend(batch.alerts.into_iter().map(|a| (cycle, a.value)));
        }
    }

    assert_eq!(delivered, vec![(2, 92.0), (5, 95.0)]);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn suppressed_repeats_keep_first_trigger_time() {
    let (pipeline, source) = pipeline(vec![cpu_rule()]);
    source.set("cpu_pct", 99.0);

    let t0 = at_cycle(0);
    pipeline.evaluator().evaluate_at(t0).await.unwrap();
    for secs in [5, 10, 20, 29] {
        pipeline
            .evaluator()
            .evaluate_at(t0 + chrono::Duration::seconds(secs))
            .await
            .unwrap();
    }

    let state = pipeline.dedup().state("cpu_high").unwrap();
    assert_eq!(state.repeat_count, 4);
    assert_eq!(state.last_triggered, t0);
    assert_eq!(pipeline.queue().len(), 1);

    // Just past the cooldown a new event goes out.
    pipeline
        .evaluator()
        .evaluate_at(t0 + chrono::Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(pipeline.queue().len(), 2);
}

// ============================================================
// Filtering
// ============================================================

#[tokio::test]
async fn subscribers_only_receive_matching_events() {
    let rules = vec![
        cpu_rule(),
        AlertRule::new("api_errors", "errors", Comparator::Gte, 10.0, Severity::Warning)
            .with_label("component", "api"),
    ];
    let h = harness(rules);

    let (critical, mut critical_rx) = MpscChannel::pair(8);
    let (api, mut api_rx) = MpscChannel::pair(8);
    h.handle
        .subscribe(
            "pager",
            Arc::new(critical),
            SubscriberFilter::severities([Severity::Critical]),
        )
        .await
        .unwrap();
    h.handle
        .subscribe(
            "api-team",
            Arc::new(api),
            SubscriberFilter::all().with_label("component", "api"),
        )
        .await
        .unwrap();

    h.source.set("cpu_pct", 95.0);
    h.source.set("errors", 12.0);
    h.evaluator.evaluate_at(at_cycle(0)).await.unwrap();
    let report = h.dispatcher.dispatch_once().await;
    assert_eq!(report.deliveries, 2);

    let pager = critical_rx.try_recv().unwrap();
    assert_eq!(pager.alerts.len(), 1);
    assert_eq!(pager.alerts[0].rule_id, "cpu_high");

    let api_batch = api_rx.try_recv().unwrap();
    assert_eq!(api_batch.alerts.len(), 1);
    assert_eq!(api_batch.alerts[0].rule_id, "api_errors");
}

// ============================================================
// Delivery failure and subscriber lifecycle
// ============================================================

#[tokio::test]
async fn failed_send_is_retried_next_cycle() {
    let h = harness(vec![cpu_rule()]);

    // A full buffer makes the second send fail without closing the channel.
    let (channel, mut rx) = MpscChannel::pair(1);
    h.handle
        .subscribe("slow", Arc::new(channel), SubscriberFilter::all())
        .await
        .unwrap();

    h.source.set("cpu_pct", 95.0);
    h.evaluator.evaluate_at(at_cycle(0)).await.unwrap();
    h.dispatcher.dispatch_once().await;

    h.evaluator.evaluate_at(at_cycle(2)).await.unwrap();
    let report = h.dispatcher.dispatch_once().await;
    assert_eq!(report.failures, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(h.queue.len(), 1);
    assert!(h.registry.contains("slow"));

    // Drain the buffer; the requeued event goes through on the next cycle.
    let first = rx.recv().await.unwrap();
    let report = h.dispatcher.dispatch_once().await;
    assert_eq!(report.deliveries, 1);
    let second = rx.recv().await.unwrap();
    assert_ne!(first.alerts[0].id, second.alerts[0].id);
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn closed_channel_is_removed_before_next_dispatch() {
    let (pipeline, source) = pipeline(vec![cpu_rule()]);
    let handle = pipeline.handle();
    let registry = pipeline.registry().clone();
    let evaluator = pipeline.evaluator().clone();
    let dispatcher = pipeline.dispatcher().clone();

    // Long intervals keep the background loops out of the way after their
    // first tick; cycles below are driven by hand.
    let cancel = CancellationToken::new();
    let task = tokio::spawn(pipeline.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (channel, mut rx) = MpscChannel::pair(8);
    handle
        .subscribe("ws-1", Arc::new(channel), SubscriberFilter::all())
        .await
        .unwrap();

    source.set("cpu_pct", 95.0);
    evaluator.evaluate_at(at_cycle(0)).await.unwrap();
    let report = dispatcher.dispatch_once().await;
    assert_eq!(report.deliveries, 1);
    assert_eq!(rx.recv().await.unwrap().alerts.len(), 1);

    // The transport goes away.
    drop(rx);
    for _ in 0..100 {
        if !registry.contains("ws-1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(!registry.contains("ws-1"));

    evaluator.evaluate_at(at_cycle(2)).await.unwrap();
    let report = dispatcher.dispatch_once().await;
    assert_eq!(report.popped, 1);
    assert_eq!(report.deliveries, 0);
    assert_eq!(report.failures, 0);
    assert_eq!(report.skipped_closed, 0);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn resubscribe_replaces_previous_channel() {
    let (pipeline, source) = pipeline(vec![cpu_rule()]);
    let handle = pipeline.handle();
    let registry = pipeline.registry().clone();
    let evaluator = pipeline.evaluator().clone();
    let dispatcher = pipeline.dispatcher().clone();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(pipeline.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (old, old_rx) = MpscChannel::pair(8);
    handle
        .subscribe("ws-1", Arc::new(old), SubscriberFilter::all())
        .await
        .unwrap();
    let (new, mut new_rx) = MpscChannel::pair(8);
    handle
        .subscribe("ws-1", Arc::new(new), SubscriberFilter::all())
        .await
        .unwrap();
    assert_eq!(registry.len(), 1);

    // Closing the replaced channel must not evict the new registration.
    drop(old_rx);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(registry.contains("ws-1"));

    source.set("cpu_pct", 95.0);
    evaluator.evaluate_at(at_cycle(0)).await.unwrap();
    dispatcher.dispatch_once().await;
    assert_eq!(new_rx.recv().await.unwrap().alerts.len(), 1);

    cancel.cancel();
    task.await.unwrap().unwrap();
}
