//! Runtime configuration: env vars resolved, rules compiled.

use super::env::resolve_env_vars;
use super::secret::SecretString;
use super::subscribers::SubscribersConfig;
use super::types::{Config, MetricsConfig, RuleConfig};
use crate::error::ConfigError;
use crate::rules::{AlertRule, Comparator, builtin_rules};
use crate::snapshot::canonical_selector;
use std::collections::HashMap;
use std::time::Duration;

/// Runtime configuration, ready to wire the pipeline.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub source: CompiledSource,
    pub evaluation_interval: Duration,
    pub cooldown: Duration,
    pub dispatch_interval: Duration,
    pub batch_size: usize,
    pub queue_max_len: Option<usize>,
    pub max_subscribers: Option<usize>,
    pub metrics: MetricsConfig,
    pub rules: Vec<AlertRule>,
    /// Whether `rules` came from the built-in list.
    pub builtin_rules: bool,
    pub subscribers: SubscribersConfig,
}

/// Metrics store endpoint with secrets resolved.
#[derive(Debug, Clone)]
pub struct CompiledSource {
    pub url: SecretString,
    pub timeout: Duration,
    pub headers: HashMap<String, SecretString>,
    pub tls_verify: bool,
}

impl Config {
    /// Compile configuration into runtime-ready format.
    ///
    /// Call [`Config::validate`] first: compilation only reports the first
    /// error it meets.
    pub fn compile(self) -> Result<RuntimeConfig, ConfigError> {
        let url = resolve_env_vars(&self.source.url)
            .map_err(|e| ConfigError::ValidationError(format!("source.url: {}", e)))?;

        let mut headers = HashMap::new();
        for (name, value) in &self.source.headers {
            let resolved = resolve_env_vars(value).map_err(|e| {
                ConfigError::ValidationError(format!("source.headers.{}: {}", name, e))
            })?;
            headers.insert(name.clone(), SecretString::new(resolved));
        }

        let (rules, builtin) = match self.rules {
            Some(rules) => (
                rules
                    .into_iter()
                    .map(compile_rule)
                    .collect::<Result<Vec<_>, _>>()?,
                false,
            ),
            None => (builtin_rules(), true),
        };

        Ok(RuntimeConfig {
            source: CompiledSource {
                url: SecretString::new(url),
                timeout: self.source.timeout,
                headers,
                tls_verify: self.source.tls_verify,
            },
            evaluation_interval: self.evaluator.interval,
            cooldown: self.evaluator.effective_cooldown(),
            dispatch_interval: self.dispatcher.interval,
            batch_size: self.dispatcher.batch_size,
            queue_max_len: self.queue.max_len,
            max_subscribers: self.registry.max_subscribers,
            metrics: self.metrics,
            rules,
            builtin_rules: builtin,
            subscribers: self.subscribers.unwrap_or_default(),
        })
    }
}

fn compile_rule(rule: RuleConfig) -> Result<AlertRule, ConfigError> {
    let metric = canonical_selector(&rule.metric).map_err(|e| ConfigError::InvalidRule {
        rule: rule.id.clone(),
        message: format!("metric: {}", e),
    })?;

    let comparator = Comparator::parse(&rule.comparator);
    if comparator == Comparator::Unknown {
        return Err(ConfigError::InvalidRule {
            rule: rule.id,
            message: format!("unknown comparator '{}'", rule.comparator),
        });
    }

    let name = rule.name.unwrap_or_else(|| rule.id.clone());
    let mut compiled = AlertRule::new(rule.id, metric, comparator, rule.threshold, rule.severity)
        .with_name(name)
        .with_message(rule.message);
    compiled.labels = rule.labels;
    Ok(compiled)
}
