//! alertd - Threshold alerting over Prometheus metrics with subscriber fan-out.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use alertd::cli::{Cli, LogFormat};
use alertd::config::{Config, RuntimeConfig};
use alertd::metrics::initialize_metrics;
use alertd::{AlertPipeline, MetricsServer};

/// Initialize the tracing subscriber with the specified log format.
fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true)
                .with_env_filter(filter)
                .init();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_format);

    info!(config_path = %cli.config.display(), "Loading configuration");

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!("Validating configuration");
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!(error = %e, "Configuration validation error");
        }
        error!(
            error_count = errors.len(),
            "Configuration validation failed"
        );
        std::process::exit(1);
    }

    if cli.validate {
        println!("Configuration is valid: {}", cli.config.display());
        println!("  Source URL: {}", config.source.url);
        match &config.rules {
            Some(rules) => println!("  Rules: {}", rules.len()),
            None => println!(
                "  Rules: {} (built-in)",
                alertd::rules::builtin_rules().len()
            ),
        }
        println!(
            "  Subscribers: {}",
            config.subscribers.as_ref().map_or(0, |s| s.len())
        );
        println!(
            "  Evaluation: every {:?} (cooldown {:?})",
            config.evaluator.interval,
            config.evaluator.effective_cooldown()
        );
        println!(
            "  Metrics: {} (port {})",
            if config.metrics.enabled {
                "enabled"
            } else {
                "disabled"
            },
            config.metrics.port
        );
        return Ok(());
    }

    let mut runtime_config = config.compile()?;
    if cli.no_metrics {
        runtime_config.metrics.enabled = false;
    }

    info!(config_path = %cli.config.display(), "alertd starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(runtime_config))
}

/// Main async entry point.
async fn run(runtime_config: RuntimeConfig) -> Result<()> {
    let cancel = CancellationToken::new();

    let rule_ids: Vec<String> = runtime_config.rules.iter().map(|r| r.id.clone()).collect();
    let mut subscriber_ids: Vec<String> = runtime_config.subscribers.keys().cloned().collect();
    subscriber_ids.sort();

    let metrics_handle = if runtime_config.metrics.enabled {
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let server = MetricsServer::with_ready_signal(runtime_config.metrics.port, ready_tx);
        let cancel_metrics = cancel.clone();
        info!(port = runtime_config.metrics.port, "Starting metrics server");
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run(cancel_metrics).await {
                error!(error = %e, "Metrics server error");
            }
        });

        match tokio::time::timeout(Duration::from_secs(2), ready_rx).await {
            Ok(Ok(())) => {
                let rule_refs: Vec<&str> = rule_ids.iter().map(String::as_str).collect();
                let subscriber_refs: Vec<&str> =
                    subscriber_ids.iter().map(String::as_str).collect();
                initialize_metrics(&rule_refs, &subscriber_refs);
            }
            _ => warn!("Metrics recorder not ready, skipping metric initialization"),
        }
        Some(handle)
    } else {
        info!("Metrics server disabled");
        None
    };

    let pipeline = AlertPipeline::from_config(runtime_config)?;
    info!(
        rules = rule_ids.len(),
        subscribers = subscriber_ids.len(),
        "Pipeline assembled"
    );

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c signal");
            return;
        }
        info!("Received shutdown signal, initiating graceful shutdown");
        cancel_clone.cancel();
    });

    let result = pipeline.run(cancel.clone()).await;

    // The pipeline can stop on its own after a fatal task failure.
    cancel.cancel();
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    match result {
        Ok(()) => {
            info!("alertd shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Pipeline error");
            Err(anyhow::anyhow!("Pipeline error: {}", e))
        }
    }
}
