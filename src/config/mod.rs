//! Configuration loading and validation for alertd.
//!
//! This module handles loading the YAML configuration file, validation,
//! environment variable substitution for secrets, and compilation into the
//! [`RuntimeConfig`] the pipeline is wired from.

mod env;
mod runtime;
mod secret;
mod subscribers;
mod types;
mod validation;

pub use env::resolve_env_vars;
pub use runtime::{CompiledSource, RuntimeConfig};
pub use secret::SecretString;
pub use subscribers::{FilterConfig, SubscriberConfig, SubscribersConfig, WebhookSubscriberConfig};
pub use types::{
    Config, DEFAULT_CONFIG_PATH, DispatcherConfig, EvaluatorConfig, MetricsConfig, QueueConfig,
    RegistryConfig, RuleConfig, SourceConfig,
};
pub use validation::validate_template_render;
