//! Rule message templating.
//!
//! Rule messages are Jinja2-style templates powered by minijinja, rendered
//! once per firing with the observed value.
//!
//! # Context
//!
//! | Variable | Meaning |
//! |---|---|
//! | `value` | observed metric value |
//! | `threshold` | rule threshold |
//! | `metric` | series selector |
//! | `rule_id` / `rule_name` | rule identity |
//! | `severity` | rule severity |
//! | `labels` | rule labels |

use minijinja::{Environment, UndefinedBehavior, context};

use crate::rules::AlertRule;

/// Renders rule messages.
///
/// A single environment is created once and reused for every render.
pub struct MessageRenderer {
    env: Environment<'static>,
}

impl Default for MessageRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Unknown variables render as empty strings.
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        Self { env }
    }

    /// Render `rule.message` for an observed value.
    ///
    /// # Errors
    ///
    /// Returns the minijinja error message if the template fails to parse or
    /// render.
    pub fn render(&self, rule: &AlertRule, value: f64) -> Result<String, String> {
        self.env
            .render_str(
                &rule.message,
                context! {
                    value => value,
                    threshold => rule.threshold,
                    metric => &rule.metric,
                    rule_id => &rule.id,
                    rule_name => &rule.name,
                    severity => rule.severity.as_str(),
                    labels => &rule.labels,
                },
            )
            .map_err(|e| e.to_string())
    }

    /// Render with fallback on error.
    ///
    /// An empty message renders as a default summary line. A broken template
    /// yields the raw template text, so an alert is never dropped for a
    /// formatting problem.
    pub fn render_with_fallback(&self, rule: &AlertRule, value: f64) -> String {
        if rule.message.trim().is_empty() {
            return default_message(rule, value);
        }

        match self.render(rule, value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    rule_id = %rule.id,
                    error = %e,
                    "Message render failed, using raw template"
                );
                rule.message.clone()
            }
        }
    }
}

impl std::fmt::Debug for MessageRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRenderer").finish()
    }
}

fn default_message(rule: &AlertRule, value: f64) -> String {
    format!(
        "{}: {} is {} ({} {})",
        rule.name, rule.metric, value, rule.comparator, rule.threshold
    )
}
