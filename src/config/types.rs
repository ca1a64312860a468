//! Core configuration types and loading.

use super::subscribers::{SubscriberConfig, SubscribersConfig, default_true};
use super::validation::{
    sample_body_context, sample_message_context, validate_jinja_template, validate_template_render,
};
use crate::error::ConfigError;
use crate::rules::{Comparator, Labels, Severity};
use crate::snapshot::canonical_selector;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/alertd/config.yaml";

/// Main configuration structure for alertd.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Metrics store to scrape.
    pub source: SourceConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Self-observability exposition.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Alert rules. The built-in list is used when absent.
    #[serde(default)]
    pub rules: Option<Vec<RuleConfig>>,
    /// Named static subscribers.
    #[serde(default)]
    pub subscribers: Option<SubscribersConfig>,
}

/// Prometheus text exposition endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Supports `${ENV_VAR}` substitution.
    pub url: String,
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra request headers (tokens, API keys). Values support `${ENV_VAR}`.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub tls_verify: bool,
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Evaluation cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_evaluation_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Minimum time between two notifications of one rule. Defaults to `interval`.
    #[serde(default, with = "humantime_serde")]
    pub cooldown: Option<Duration>,
}

fn default_evaluation_interval() -> Duration {
    crate::evaluator::DEFAULT_EVALUATION_INTERVAL
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            interval: default_evaluation_interval(),
            cooldown: None,
        }
    }
}

impl EvaluatorConfig {
    pub fn effective_cooldown(&self) -> Duration {
        self.cooldown.unwrap_or(self.interval)
    }
}

/// Delivery cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_dispatch_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_dispatch_interval() -> Duration {
    crate::notify::dispatcher::DEFAULT_DISPATCH_INTERVAL
}

fn default_batch_size() -> usize {
    crate::notify::DEFAULT_BATCH_SIZE
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: default_dispatch_interval(),
            batch_size: default_batch_size(),
        }
    }
}

/// Notification queue bound.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfig {
    /// Absent means unbounded.
    #[serde(default)]
    pub max_len: Option<usize>,
}

/// Subscriber registry limits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    /// Absent means unlimited.
    #[serde(default)]
    pub max_subscribers: Option<usize>,
}

/// Metrics exposition configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// Alert rule configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Series selector, e.g. `http_requests_total{code="500"}`.
    pub metric: String,
    pub threshold: f64,
    /// `gt`, `lt`, `eq`, `gte`, `lte` (or `>`, `<`, `==`, `>=`, `<=`).
    pub comparator: String,
    pub severity: Severity,
    /// Message template.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub labels: Labels,
}

impl Config {
    /// Load configuration from a file path.
    ///
    /// # Errors
    /// Returns [`ConfigError::LoadError`] if the file cannot be read.
    /// Returns [`ConfigError::ValidationError`] if the YAML is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] if the YAML is invalid.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate the whole configuration, collecting every error.
    ///
    /// # Errors
    /// Returns a `Vec<ConfigError>` containing all validation errors found.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if self.source.url.trim().is_empty() {
            errors.push(ConfigError::ValidationError(
                "source.url cannot be empty".to_string(),
            ));
        }
        if self.source.timeout.is_zero() {
            errors.push(ConfigError::ValidationError(
                "source.timeout must be greater than zero".to_string(),
            ));
        }
        if self.evaluator.interval.is_zero() {
            errors.push(ConfigError::ValidationError(
                "evaluator.interval must be greater than zero".to_string(),
            ));
        }
        if self.dispatcher.interval.is_zero() {
            errors.push(ConfigError::ValidationError(
                "dispatcher.interval must be greater than zero".to_string(),
            ));
        }
        if self.dispatcher.batch_size == 0 {
            errors.push(ConfigError::ValidationError(
                "dispatcher.batch_size must be at least 1".to_string(),
            ));
        }
        if self.queue.max_len == Some(0) {
            errors.push(ConfigError::ValidationError(
                "queue.max_len must be at least 1 when set".to_string(),
            ));
        }
        if self.registry.max_subscribers == Some(0) {
            errors.push(ConfigError::ValidationError(
                "registry.max_subscribers must be at least 1 when set".to_string(),
            ));
        }

        if let Some(rules) = &self.rules {
            if rules.is_empty() {
                errors.push(ConfigError::ValidationError(
                    "rules cannot be empty when defined (omit the section to use built-in rules)"
                        .to_string(),
                ));
            }
            let mut seen = HashSet::new();
            for rule in rules {
                validate_rule(rule, &mut seen, &mut errors);
            }
        }

        if let Some(subscribers) = &self.subscribers {
            for (name, subscriber) in subscribers {
                validate_subscriber(name, subscriber, &mut errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_rule<'a>(rule: &'a RuleConfig, seen: &mut HashSet<&'a str>, errors: &mut Vec<ConfigError>) {
    let invalid = |message: String| ConfigError::InvalidRule {
        rule: rule.id.clone(),
        message,
    };

    if rule.id.trim().is_empty() {
        errors.push(ConfigError::ValidationError(
            "rule id cannot be empty".to_string(),
        ));
    } else if !seen.insert(rule.id.as_str()) {
        errors.push(invalid("duplicate rule id".to_string()));
    }

    if let Err(e) = canonical_selector(&rule.metric) {
        errors.push(invalid(format!("metric: {}", e)));
    }

    if !rule.threshold.is_finite() {
        errors.push(invalid(format!(
            "threshold must be a finite number, got {}",
            rule.threshold
        )));
    }

    if Comparator::parse(&rule.comparator) == Comparator::Unknown {
        errors.push(invalid(format!(
            "unknown comparator '{}': expected gt, lt, eq, gte or lte",
            rule.comparator
        )));
    }

    if let Err(e) = validate_jinja_template(&rule.message) {
        errors.push(ConfigError::InvalidTemplate {
            rule: rule.id.clone(),
            message: format!("message: {}", e),
        });
    } else if let Err(e) = validate_template_render(&rule.message, &sample_message_context()) {
        errors.push(ConfigError::InvalidTemplate {
            rule: rule.id.clone(),
            message: format!("message render: {}", e),
        });
    }
}

fn validate_subscriber(name: &str, subscriber: &SubscriberConfig, errors: &mut Vec<ConfigError>) {
    let invalid = |message: String| ConfigError::InvalidSubscriber {
        name: name.to_string(),
        message,
    };

    if subscriber.filter().severities.is_empty() {
        errors.push(invalid(
            "filter.severities must list at least one severity".to_string(),
        ));
    }

    match subscriber {
        SubscriberConfig::Webhook(cfg) => {
            if cfg.url.trim().is_empty() {
                errors.push(invalid("url cannot be empty".to_string()));
            }
            let method = cfg.method.to_uppercase();
            if method != "POST" && method != "PUT" {
                errors.push(invalid(format!(
                    "unsupported method '{}': only POST and PUT are supported",
                    cfg.method
                )));
            }
            if let Some(template) = &cfg.body_template {
                if let Err(e) = validate_jinja_template(template) {
                    errors.push(invalid(format!("body_template: {}", e)));
                } else if let Err(e) = validate_template_render(template, &sample_body_context(name))
                {
                    errors.push(invalid(format!("body_template render: {}", e)));
                }
            }
        }
    }
}
