//! Environment variable substitution.

use crate::error::ConfigError;
use regex::Regex;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Resolves `${VAR_NAME}` patterns in a string.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] listing every undefined variable.
pub fn resolve_env_vars(value: &str) -> Result<String, ConfigError> {
    let mut missing = Vec::new();

    let resolved = ENV_VAR_PATTERN.replace_all(value, |caps: &regex::Captures<'_>| {
        let var_name = &caps[1];
        match std::env::var(var_name) {
            Ok(var_value) => var_value,
            Err(_) => {
                missing.push(var_name.to_string());
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(resolved.into_owned())
    } else {
        Err(ConfigError::ValidationError(format!(
            "undefined environment variable{}: {}",
            if missing.len() > 1 { "s" } else { "" },
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn substitutes_single_variable() {
        temp_env::with_var("TEST_METRICS_URL", Some("http://prom:9090/metrics"), || {
            let result = resolve_env_vars("${TEST_METRICS_URL}");
            assert_eq!(result.unwrap(), "http://prom:9090/metrics");
        });
    }

    #[test]
    #[serial]
    fn substitutes_multiple_variables() {
        temp_env::with_vars(
            [
                ("TEST_HOST", Some("hooks.example.com")),
                ("TEST_TOKEN", Some("secret123")),
            ],
            || {
                let result = resolve_env_vars("https://${TEST_HOST}/hooks/${TEST_TOKEN}");
                assert_eq!(result.unwrap(), "https://hooks.example.com/hooks/secret123");
            },
        );
    }

    #[test]
    fn returns_unchanged_without_pattern() {
        let input = "https://example.com/static/path";
        assert_eq!(resolve_env_vars(input).unwrap(), input);
    }

    #[test]
    fn dollar_without_braces_is_literal() {
        assert_eq!(resolve_env_vars("cost $5").unwrap(), "cost $5");
    }

    #[test]
    #[serial]
    fn error_lists_all_undefined_variables() {
        temp_env::with_vars(
            [("UNDEFINED_A", None::<&str>), ("UNDEFINED_B", None::<&str>)],
            || {
                let err = resolve_env_vars("${UNDEFINED_A} and ${UNDEFINED_B}").unwrap_err();
                let msg = err.to_string();
                assert!(msg.contains("variables"));
                assert!(msg.contains("UNDEFINED_A"));
                assert!(msg.contains("UNDEFINED_B"));
            },
        );
    }

    #[test]
    #[serial]
    fn preserves_text_around_variables() {
        temp_env::with_var("TEST_MIDDLE", Some("REPLACED"), || {
            let result = resolve_env_vars("prefix_${TEST_MIDDLE}_suffix");
            assert_eq!(result.unwrap(), "prefix_REPLACED_suffix");
        });
    }

    #[test]
    #[serial]
    fn handles_empty_env_value() {
        temp_env::with_var("TEST_EMPTY_VAR", Some(""), || {
            assert_eq!(resolve_env_vars("before${TEST_EMPTY_VAR}after").unwrap(), "beforeafter");
        });
    }
}
