//! Centralized error types for alertd using thiserror.
//!
//! Each pipeline stage owns one error enum. None of them is fatal to the
//! process: callers log and retry on the next scheduled cycle.

use thiserror::Error;

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load config file: {0}")]
    LoadError(String),
    #[error("invalid configuration: {0}")]
    ValidationError(String),
    #[error("invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },
    #[error("invalid template in rule '{rule}': {message}")]
    InvalidTemplate { rule: String, message: String },
    #[error("invalid subscriber '{name}': {message}")]
    InvalidSubscriber { name: String, message: String },
}

/// Errors raised while reading a metric snapshot from the metrics store.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("metrics fetch failed: {0}")]
    Fetch(String),
    #[error("metrics endpoint returned HTTP {0}")]
    HttpStatus(u16),
    #[error("failed to read metrics body: {0}")]
    Body(String),
}

/// Errors related to delivering a batch to one subscriber channel.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("subscriber channel closed")]
    ChannelClosed,
    #[error("failed to send batch: {0}")]
    SendFailed(String),
    #[error("failed to serialize batch: {0}")]
    Serialization(String),
}

/// Errors related to subscriber registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("subscriber limit of {limit} reached")]
    CapacityReached { limit: usize },
    #[error("subscriber registry closed")]
    Closed,
}

/// Errors related to acknowledging an alert.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AckError {
    #[error("rule '{0}' has never fired")]
    UnknownRule(String),
    #[error("rule '{0}' is not currently firing")]
    NotActive(String),
}

/// Errors surfaced by the pipeline supervisor.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{task} task failed: {message}")]
    TaskFailed { task: &'static str, message: String },
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SnapshotError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
