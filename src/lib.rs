// src/lib.rs
//! alertd - Threshold alerting over Prometheus metrics with subscriber fan-out.
//!
//! Rules are evaluated against periodic metric snapshots; breaches pass a
//! per-rule cooldown, are queued, and are flushed in batches to every
//! subscriber whose severity and label filter matches.

pub mod cli;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod notify;
pub mod rules;
pub mod snapshot;
pub mod subscribers;
pub mod template;

// Re-export commonly used types
pub use cli::LogFormat;
pub use dedup::{Acknowledgement, Admission, Deduplicator, RuleFiringState};
pub use engine::{AlertPipeline, PipelineSettings};
pub use evaluator::{AlertEvaluator, CycleReport};
pub use metrics::{MetricsServer, register_metric_descriptions};
pub use notify::{
    AlertBatch, AlertEvent, DispatchReport, Dispatcher, MpscChannel, NotificationQueue,
    SubscriberChannel, WebhookChannel,
};
pub use rules::{AlertRule, Comparator, Labels, RuleRegistry, Severity};
pub use snapshot::{MetricSnapshot, MetricSource, PrometheusScraper, StaticMetricSource};
pub use subscribers::{RegistryHandle, SubscriberFilter, SubscriberRegistry};
pub use template::MessageRenderer;
