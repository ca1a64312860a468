//! Integration tests for webhook subscribers wired from configuration.
//!
//! Uses wiremock to simulate the receiving endpoints.

use std::time::Duration;

use alertd::{AlertEvent, AlertPipeline, AlertRule, Comparator, Severity};
use alertd::config::Config;
use chrono::{TimeZone, Utc};
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_yaml(hook_url: &str, extra: &str) -> String {
    format!(
        r#"
source:
  url: http://127.0.0.1:1/metrics
evaluator:
  interval: 30s
rules:
  - id: cpu_high
    name: CPU high
    metric: cpu_pct
    threshold: 90
    comparator: gt
    severity: critical
    message: "CPU at {{{{ value }}}}%"
    labels:
      component: host
subscribers:
  ops:
    type: webhook
    url: {hook_url}
{extra}
"#
    )
}

fn build(yaml: &str) -> AlertPipeline {
    let config = Config::from_yaml(yaml).unwrap();
    config.validate().unwrap();
    AlertPipeline::from_config(config.compile().unwrap()).unwrap()
}

/// Offer a `cpu_high` firing straight to the deduplicator, bypassing the scraper.
fn fire(pipeline: &AlertPipeline, value: f64) {
    let rule = AlertRule::new("cpu_high", "cpu_pct", Comparator::Gt, 90.0, Severity::Critical)
        .with_name("CPU high")
        .with_label("component", "host");
    let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let event = AlertEvent::new(&rule, value, format!("CPU at {}%", value), now);
    pipeline.dedup().admit(event, now);
}

// ============================================================
// Delivery
// ============================================================

#[tokio::test]
async fn batch_is_posted_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/ops"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(serde_json::json!({
            "alerts": [{
                "rule_id": "cpu_high",
                "severity": "critical",
                "value": 95.0,
                "labels": { "component": "host" }
            }]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = build(&config_yaml(&format!("{}/hooks/ops", server.uri()), ""));
    fire(&pipeline, 95.0);

    let report = pipeline.dispatcher().dispatch_once().await;
    assert_eq!(report.deliveries, 1);
    assert!(pipeline.queue().is_empty());
}

#[tokio::test]
async fn body_template_and_headers_are_applied() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(header("authorization", "Bearer abc"))
        .and(header("content-type", "text/plain"))
        .and(body_string_contains("1 alert(s) for ops: CPU high"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let extra = r#"    method: PUT
    headers:
      Authorization: Bearer abc
      Content-Type: text/plain
    body_template: "{{ count }} alert(s) for {{ subscriber }}: {% for a in alerts %}{{ a.rule_name }}{% endfor %}""#;
    let pipeline = build(&config_yaml(&server.uri(), extra));
    fire(&pipeline, 97.0);

    let report = pipeline.dispatcher().dispatch_once().await;
    assert_eq!(report.deliveries, 1);
}

#[tokio::test]
async fn filtered_out_severity_is_never_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let extra = "    filter:\n      severities: [warning]";
    let pipeline = build(&config_yaml(&server.uri(), extra));
    fire(&pipeline, 95.0);

    let report = pipeline.dispatcher().dispatch_once().await;
    assert_eq!(report.popped, 1);
    assert_eq!(report.deliveries, 0);
}

// ============================================================
// Failure handling
// ============================================================

#[tokio::test]
async fn server_error_requeues_until_endpoint_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = build(&config_yaml(&server.uri(), ""));
    fire(&pipeline, 95.0);

    let first = pipeline.dispatcher().dispatch_once().await;
    assert_eq!(first.failures, 1);
    assert_eq!(first.requeued, 1);
    assert_eq!(pipeline.queue().len(), 1);
    // Webhook subscribers are never removed for failed sends.
    assert!(pipeline.registry().contains("ops"));

    let second = pipeline.dispatcher().dispatch_once().await;
    assert_eq!(second.deliveries, 1);
    assert!(pipeline.queue().is_empty());
}

#[tokio::test]
async fn unreachable_endpoint_requeues() {
    // Nothing listens on port 1.
    let pipeline = build(&config_yaml("http://127.0.0.1:1/hook", ""));
    fire(&pipeline, 95.0);

    let report = tokio::time::timeout(
        Duration::from_secs(15),
        pipeline.dispatcher().dispatch_once(),
    )
    .await
    .unwrap();
    assert_eq!(report.failures, 1);
    assert_eq!(pipeline.queue().len(), 1);
}
