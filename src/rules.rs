//! Alert rule definitions and the fixed rule registry.
//!
//! Rules are immutable once registered. The registry is built once at
//! startup, either from the `rules` section of the configuration or from
//! [`builtin_rules`], and is never reloaded.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Typed label set attached to rules and copied onto alert events.
///
/// Ordered so that serialized events and log output are stable.
pub type Labels = BTreeMap<String, String>;

/// Alert severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "WARNING")]
    Warning,
    #[serde(alias = "CRITICAL")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!(
                "unknown severity '{}': expected info, warning or critical",
                other
            )),
        }
    }
}

/// Threshold comparator.
///
/// `Unknown` carries rules whose comparator could not be recognised; such a
/// rule never fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Lt,
    Eq,
    Gte,
    Lte,
    Unknown,
}

impl Comparator {
    /// Parse a comparator token. Unrecognised tokens map to `Unknown`.
    pub fn parse(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "gt" | ">" => Comparator::Gt,
            "lt" | "<" => Comparator::Lt,
            "eq" | "==" => Comparator::Eq,
            "gte" | ">=" => Comparator::Gte,
            "lte" | "<=" => Comparator::Lte,
            _ => Comparator::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Gt => "gt",
            Comparator::Lt => "lt",
            Comparator::Eq => "eq",
            Comparator::Gte => "gte",
            Comparator::Lte => "lte",
            Comparator::Unknown => "unknown",
        }
    }

    /// Apply the comparator to `(value, threshold)`.
    ///
    /// Equality is exact, with no epsilon. Any comparison involving NaN is
    /// false, so a NaN sample never fires.
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Eq => value == threshold,
            Comparator::Gte => value >= threshold,
            Comparator::Lte => value <= threshold,
            Comparator::Unknown => false,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A static threshold condition over a named metric.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    /// Canonical series selector, e.g. `cpu_pct` or `http_errors{code="500"}`.
    pub metric: String,
    pub threshold: f64,
    pub comparator: Comparator,
    pub severity: Severity,
    /// Message template rendered for each firing.
    pub message: String,
    pub labels: Labels,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        metric: impl Into<String>,
        comparator: Comparator,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            message: String::new(),
            id,
            metric: metric.into(),
            threshold,
            comparator,
            severity,
            labels: Labels::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether an observed value breaches this rule.
    pub fn breached(&self, value: f64) -> bool {
        self.comparator.apply(value, self.threshold)
    }
}

/// Fixed set of rules, keyed by id, in registration order.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<AlertRule>,
}

impl RuleRegistry {
    /// Build a registry, rejecting duplicate or empty ids.
    pub fn new(rules: Vec<AlertRule>) -> Result<Self, ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            if rule.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "rule id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::InvalidRule {
                    rule: rule.id.clone(),
                    message: "duplicate rule id".to_string(),
                });
            }
        }

        for rule in &rules {
            tracing::info!(
                rule_id = %rule.id,
                metric = %rule.metric,
                comparator = %rule.comparator,
                threshold = rule.threshold,
                severity = %rule.severity,
                "Registered alert rule"
            );
        }

        Ok(Self { rules })
    }

    pub fn get(&self, id: &str) -> Option<&AlertRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Rules used when the configuration does not define its own.
pub fn builtin_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "high_cpu_usage",
            "process_cpu_usage_percent",
            Comparator::Gt,
            90.0,
            Severity::Critical,
        )
        .with_name("High CPU usage")
        .with_message("CPU usage is {{ value }}% (threshold {{ threshold }}%)")
        .with_label("component", "host"),
        AlertRule::new(
            "high_memory_usage",
            "process_memory_usage_percent",
            Comparator::Gt,
            85.0,
            Severity::Warning,
        )
        .with_name("High memory usage")
        .with_message("Memory usage is {{ value }}% (threshold {{ threshold }}%)")
        .with_label("component", "host"),
        AlertRule::new(
            "high_error_rate",
            "http_error_rate_percent",
            Comparator::Gt,
            5.0,
            Severity::Critical,
        )
        .with_name("High HTTP error rate")
        .with_message("HTTP error rate is {{ value }}% (threshold {{ threshold }}%)")
        .with_label("component", "api"),
        AlertRule::new(
            "slow_responses",
            "http_response_time_p95_ms",
            Comparator::Gte,
            1000.0,
            Severity::Warning,
        )
        .with_name("Slow API responses")
        .with_message("p95 response time is {{ value }}ms")
        .with_label("component", "api"),
        AlertRule::new(
            "no_active_agents",
            "active_agents",
            Comparator::Lt,
            1.0,
            Severity::Warning,
        )
        .with_name("No active agents")
        .with_message("No agent has reported in the last evaluation interval")
        .with_label("component", "agents"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gt_fires_only_above_threshold() {
        let rule = AlertRule::new("cpu", "cpu_pct", Comparator::Gt, 90.0, Severity::Critical);
        assert!(!rule.breached(89.0));
        assert!(!rule.breached(90.0));
        assert!(rule.breached(91.0));
    }

    #[test]
    fn comparator_boundaries() {
        assert!(Comparator::Lt.apply(9.0, 10.0));
        assert!(!Comparator::Lt.apply(10.0, 10.0));
        assert!(Comparator::Gte.apply(10.0, 10.0));
        assert!(!Comparator::Gte.apply(9.0, 10.0));
        assert!(Comparator::Lte.apply(10.0, 10.0));
        assert!(!Comparator::Lte.apply(11.0, 10.0));
    }

    #[test]
    fn eq_is_exact() {
        assert!(Comparator::Eq.apply(0.3, 0.3));
        assert!(!Comparator::Eq.apply(0.1 + 0.2, 0.3));
    }

    #[test]
    fn unknown_comparator_never_fires() {
        let cmp = Comparator::parse("approximately");
        assert_eq!(cmp, Comparator::Unknown);
        for value in [f64::MIN, -1.0, 0.0, 1.0, f64::MAX, f64::INFINITY] {
            assert!(!cmp.apply(value, 0.0));
        }
    }

    #[test]
    fn nan_never_fires() {
        for cmp in [
            Comparator::Gt,
            Comparator::Lt,
            Comparator::Eq,
            Comparator::Gte,
            Comparator::Lte,
        ] {
            assert!(!cmp.apply(f64::NAN, 1.0), "{} fired on NaN", cmp);
        }
    }

    #[test]
    fn comparator_parse_accepts_symbols_and_case() {
        assert_eq!(Comparator::parse("GT"), Comparator::Gt);
        assert_eq!(Comparator::parse(">="), Comparator::Gte);
        assert_eq!(Comparator::parse(" lte "), Comparator::Lte);
        assert_eq!(Comparator::parse("=="), Comparator::Eq);
    }

    #[test]
    fn severity_from_str() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warning);
        assert!("fatal".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_serde_accepts_uppercase_alias() {
        let sev: Severity = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(sev, Severity::Critical);
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "\"warning\"");
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let rules = vec![
            AlertRule::new("a", "m", Comparator::Gt, 1.0, Severity::Info),
            AlertRule::new("a", "n", Comparator::Lt, 1.0, Severity::Info),
        ];
        let err = RuleRegistry::new(rules).unwrap_err();
        assert!(err.to_string().contains("duplicate rule id"));
    }

    #[test]
    fn registry_rejects_empty_id() {
        let rules = vec![AlertRule::new(" ", "m", Comparator::Gt, 1.0, Severity::Info)];
        assert!(RuleRegistry::new(rules).is_err());
    }

    #[test]
    fn registry_lookup_preserves_order() {
        let registry = RuleRegistry::new(builtin_rules()).unwrap();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.ids().next(), Some("high_cpu_usage"));
        let rule = registry.get("high_error_rate").unwrap();
        assert_eq!(rule.labels.get("component").map(String::as_str), Some("api"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn builtin_rules_have_unique_ids_and_known_comparators() {
        let rules = builtin_rules();
        let ids: std::collections::HashSet<_> = rules.iter().map(|r| &r.id).collect();
        assert_eq!(ids.len(), rules.len());
        assert!(rules.iter().all(|r| r.comparator != Comparator::Unknown));
    }
}
