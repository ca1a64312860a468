//! Alert delivery for alertd.
//!
//! This module sits at the end of the pipeline:
//! ```text
//! evaluator.rs -> dedup.rs -> notify::queue -> notify::dispatcher -> subscribers
//! ```
//!
//! # Key Features
//!
//! - **Decoupled cadences**: detection enqueues, delivery drains on its own
//!   (much shorter) interval.
//! - **Batched fan-out**: each subscriber receives its matching subset of a
//!   batch as a single message.
//! - **At-least-once**: events from a failed send are requeued at the tail.
//! - **Opaque channels**: in-process (`MpscChannel`) and HTTP
//!   (`WebhookChannel`) subscribers share the `SubscriberChannel` trait.

pub mod channel;
pub mod dispatcher;
pub mod queue;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::rules::{AlertRule, Labels, Severity};

pub use channel::{AlertBatch, MpscChannel, SubscriberChannel};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use queue::NotificationQueue;
pub use webhook::WebhookChannel;

/// Default number of events drained per dispatch cycle.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// One detected firing of a rule, ready for delivery.
///
/// Created by the evaluator; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    /// Generated per firing.
    pub id: Uuid,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    /// Rendered rule message.
    pub message: String,
    /// Series selector the value was read from.
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    /// Copied from the rule.
    pub labels: Labels,
}

impl AlertEvent {
    /// Build an event for `rule` observed at `value`.
    pub fn new(rule: &AlertRule, value: f64, message: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            message,
            metric: rule.metric.clone(),
            value,
            threshold: rule.threshold,
            created_at,
            labels: rule.labels.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_event(rule_id: &str, severity: Severity) -> Self {
        let rule = AlertRule::new(
            rule_id,
            "test_metric",
            crate::rules::Comparator::Gt,
            1.0,
            severity,
        );
        Self::new(&rule, 2.0, format!("{} fired", rule_id), Utc::now())
    }
}
