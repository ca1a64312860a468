//! Statically configured subscribers.

use serde::Deserialize;
use std::collections::HashMap;

use crate::rules::{Labels, Severity};
use crate::subscribers::SubscriberFilter;

/// Map of named subscriber configurations.
pub type SubscribersConfig = HashMap<String, SubscriberConfig>;

/// Subscriber configuration with type tag for deserialization.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SubscriberConfig {
    #[serde(rename = "webhook")]
    Webhook(WebhookSubscriberConfig),
}

impl SubscriberConfig {
    pub fn filter(&self) -> &FilterConfig {
        match self {
            SubscriberConfig::Webhook(cfg) => &cfg.filter,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SubscriberConfig::Webhook(_) => "webhook",
        }
    }
}

/// Configuration for a webhook subscriber.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSubscriberConfig {
    /// Target URL (supports `${ENV_VAR}` substitution).
    pub url: String,
    #[serde(default = "default_post")]
    pub method: String,
    /// Header values support `${ENV_VAR}` substitution.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Optional minijinja body; the JSON batch is sent when absent.
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Severity and label filter of a subscriber.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FilterConfig {
    #[serde(default = "all_severities")]
    pub severities: Vec<Severity>,
    /// Required labels: every pair must be present in the event.
    #[serde(default)]
    pub labels: Labels,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            severities: all_severities(),
            labels: Labels::new(),
        }
    }
}

impl FilterConfig {
    pub fn to_filter(&self) -> SubscriberFilter {
        SubscriberFilter {
            severities: self.severities.iter().copied().collect(),
            labels: self.labels.clone(),
        }
    }
}

fn all_severities() -> Vec<Severity> {
    vec![Severity::Info, Severity::Warning, Severity::Critical]
}

fn default_post() -> String {
    "POST".to_string()
}

pub(crate) fn default_true() -> bool {
    true
}
