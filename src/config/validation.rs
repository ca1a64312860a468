//! Template validation utilities.

use minijinja::{Environment, UndefinedBehavior};

/// Sample context for rule message render tests.
pub(crate) fn sample_message_context() -> serde_json::Value {
    serde_json::json!({
        "value": 0.0,
        "threshold": 0.0,
        "metric": "metric",
        "rule_id": "rule",
        "rule_name": "rule",
        "severity": "info",
        "labels": {},
    })
}

/// Sample context for webhook body render tests.
pub(crate) fn sample_body_context(subscriber: &str) -> serde_json::Value {
    serde_json::json!({
        "alerts": [],
        "count": 0,
        "sent_at": "1970-01-01T00:00:00+00:00",
        "subscriber": subscriber,
    })
}

/// Validates Jinja template syntax.
pub(crate) fn validate_jinja_template(source: &str) -> Result<(), String> {
    let mut env = Environment::new();
    env.add_template("_validate", source)
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Validates a Jinja template by performing a test render with sample data.
/// Detects runtime errors like unknown filters.
///
/// # Errors
/// Returns an error string if the template syntax is invalid or uses unknown filters.
pub fn validate_template_render(source: &str, sample: &serde_json::Value) -> Result<(), String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.add_template("_render_test", source)
        .map_err(|e| e.to_string())?;

    let tmpl = env
        .get_template("_render_test")
        .map_err(|e| e.to_string())?;
    tmpl.render(sample)
        .map_err(|e| e.to_string())?;

    Ok(())
}
