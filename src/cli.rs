//! Command-line interface for alertd.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines on stderr (default).
    #[default]
    Text,
    /// One JSON object per event, span fields flattened.
    Json,
}

/// Threshold alerting over Prometheus metrics with subscriber fan-out.
#[derive(Parser, Debug)]
#[command(name = "alertd")]
#[command(version)]
#[command(about = "Threshold alerting over Prometheus metrics with subscriber fan-out")]
#[command(
    long_about = "Scrapes a Prometheus endpoint on a fixed interval, evaluates threshold \
                  rules with a per-rule cooldown, and delivers alert batches to every \
                  subscriber whose severity and label filter matches."
)]
pub struct Cli {
    /// Rules, source and subscribers file (YAML).
    #[arg(
        short = 'c',
        long = "config",
        default_value = DEFAULT_CONFIG_PATH,
        env = "ALERTD_CONFIG"
    )]
    pub config: PathBuf,

    /// Check the config file, print a rules/subscribers summary and exit.
    #[arg(long = "validate")]
    pub validate: bool,

    /// Do not start the Prometheus exporter, whatever `metrics.enabled` says.
    #[arg(long = "no-metrics")]
    pub no_metrics: bool,

    /// Log format: text or json.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    pub log_format: LogFormat,
}
