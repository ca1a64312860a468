//! Pipeline wiring and task supervision.
//!
//! [`AlertPipeline`] owns the single instance of every pipeline component and
//! runs the long-lived tasks under one supervisor:
//!
//! ```text
//! main.rs
//!     |
//!     v
//! engine.rs (AlertPipeline)
//!     |
//!     +-- spawn --> AlertEvaluator::run  --> Deduplicator --> NotificationQueue
//!     +-- spawn --> Dispatcher::run      --> SubscriberRegistry snapshot --> channels
//!     +-- spawn --> RegistryWorker::run  <-- RegistryHandle (subscribe), channel close watchers
//! ```
//!
//! The evaluator and dispatcher are respawned after a panic. The registry
//! worker owns its event receiver and cannot be rebuilt, so a panic there
//! stops the pipeline with [`EngineError::TaskFailed`].
//!
//! # Example
//!
//! ```ignore
//! use alertd::engine::AlertPipeline;
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = AlertPipeline::from_config(runtime_config)?;
//! let cancel = CancellationToken::new();
//!
//! // Run until cancelled
//! pipeline.run(cancel).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{RuntimeConfig, SubscriberConfig};
use crate::dedup::Deduplicator;
use crate::error::EngineError;
use crate::evaluator::{AlertEvaluator, DEFAULT_EVALUATION_INTERVAL};
use crate::notify::dispatcher::DEFAULT_DISPATCH_INTERVAL;
use crate::notify::{DEFAULT_BATCH_SIZE, Dispatcher, NotificationQueue, WebhookChannel};
use crate::rules::RuleRegistry;
use crate::snapshot::{MetricSource, PrometheusScraper};
use crate::subscribers::{RegistryHandle, RegistryWorker, SubscriberRegistry};

/// Delay before restarting a task after panic.
const PANIC_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Timeout of the HTTP client shared by webhook subscribers.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing and capacity knobs of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub evaluation_interval: Duration,
    pub cooldown: Duration,
    pub dispatch_interval: Duration,
    pub batch_size: usize,
    pub queue_max_len: Option<usize>,
    pub max_subscribers: Option<usize>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            cooldown: DEFAULT_EVALUATION_INTERVAL,
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_max_len: None,
            max_subscribers: None,
        }
    }
}

impl PipelineSettings {
    fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            evaluation_interval: config.evaluation_interval,
            cooldown: config.cooldown,
            dispatch_interval: config.dispatch_interval,
            batch_size: config.batch_size,
            queue_max_len: config.queue_max_len,
            max_subscribers: config.max_subscribers,
        }
    }
}

/// Long-lived tasks run by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineTask {
    Evaluator,
    Dispatcher,
    Registry,
}

impl PipelineTask {
    fn name(self) -> &'static str {
        match self {
            PipelineTask::Evaluator => "evaluator",
            PipelineTask::Dispatcher => "dispatcher",
            PipelineTask::Registry => "registry",
        }
    }
}

/// The assembled alert pipeline.
///
/// Components are constructed once and shared by reference counting; clone
/// the handles you need (queue, registry, deduplicator) before calling
/// [`AlertPipeline::run`], which consumes the pipeline.
pub struct AlertPipeline {
    queue: NotificationQueue,
    dedup: Arc<Deduplicator>,
    evaluator: Arc<AlertEvaluator>,
    dispatcher: Arc<Dispatcher>,
    registry: SubscriberRegistry,
    handle: RegistryHandle,
    worker: RegistryWorker,
}

impl AlertPipeline {
    /// Wire a pipeline around an arbitrary metric source.
    pub fn new(
        rules: RuleRegistry,
        source: Arc<dyn MetricSource>,
        settings: PipelineSettings,
    ) -> Self {
        let queue = NotificationQueue::new(settings.queue_max_len);
        let dedup = Arc::new(Deduplicator::new(settings.cooldown, queue.clone()));
        let evaluator = Arc::new(AlertEvaluator::new(
            Arc::new(rules),
            source,
            dedup.clone(),
            settings.evaluation_interval,
        ));
        let registry = SubscriberRegistry::new(settings.max_subscribers);
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            registry.clone(),
            settings.batch_size,
            settings.dispatch_interval,
        ));
        let (worker, handle) = RegistryWorker::new(registry.clone());

        Self {
            queue,
            dedup,
            evaluator,
            dispatcher,
            registry,
            handle,
            worker,
        }
    }

    /// Build the pipeline described by a compiled configuration.
    ///
    /// Scrapes the configured Prometheus endpoint and registers every static
    /// webhook subscriber.
    ///
    /// # Errors
    ///
    /// Fails if the rule list is invalid, the scraper or HTTP client cannot
    /// be built, or a subscriber cannot be created or registered.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, EngineError> {
        let settings = PipelineSettings::from_runtime(&config);
        let source = PrometheusScraper::new(
            config.source.url.clone(),
            config.source.timeout,
            config.source.headers.clone(),
            config.source.tls_verify,
        )?;
        let rules = RuleRegistry::new(config.rules)?;
        if config.builtin_rules {
            info!(rule_count = rules.len(), "No rules configured, using built-in rules");
        }

        let pipeline = Self::new(rules, Arc::new(source), settings);

        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| EngineError::HttpClient(e.to_string()))?;

        let mut names: Vec<&String> = config.subscribers.keys().collect();
        names.sort();
        for name in names {
            let subscriber = &config.subscribers[name];
            match subscriber {
                SubscriberConfig::Webhook(cfg) => {
                    let channel = WebhookChannel::from_config(name, cfg, client.clone())?;
                    pipeline
                        .registry
                        .subscribe(name.clone(), Arc::new(channel), cfg.filter.to_filter())?;
                }
            }
        }

        Ok(pipeline)
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    pub fn dedup(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    pub fn evaluator(&self) -> &Arc<AlertEvaluator> {
        &self.evaluator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Handle for transport layers adding and removing subscribers.
    pub fn handle(&self) -> RegistryHandle {
        self.handle.clone()
    }

    /// Run every pipeline task until cancelled.
    ///
    /// On cancellation the evaluator and dispatcher finish their current
    /// cycle, then the events still queued are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TaskFailed`] if the registry worker panics.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        let AlertPipeline {
            queue,
            evaluator,
            dispatcher,
            worker,
            ..
        } = self;

        // Child token so a fatal task failure can stop its siblings.
        let shutdown = cancel.child_token();
        let mut tasks: JoinSet<PipelineTask> = JoinSet::new();
        let mut task_ids: HashMap<tokio::task::Id, PipelineTask> = HashMap::new();

        let handle = tasks.spawn({
            let shutdown = shutdown.clone();
            async move {
                worker.run(shutdown).await;
                PipelineTask::Registry
            }
        });
        task_ids.insert(handle.id(), PipelineTask::Registry);

        for task in [PipelineTask::Evaluator, PipelineTask::Dispatcher] {
            spawn_loop(
                &mut tasks,
                &mut task_ids,
                task,
                &evaluator,
                &dispatcher,
                shutdown.clone(),
            );
        }

        info!("Alert pipeline started");

        let result = supervise(
            &mut tasks,
            &mut task_ids,
            &evaluator,
            &dispatcher,
            &shutdown,
        )
        .await;

        // Wait for in-flight cycles; never abort mid-send.
        shutdown.cancel();
        while tasks.join_next().await.is_some() {}

        let discarded = queue.clear();
        if discarded > 0 {
            warn!(discarded, "Discarding queued alerts on shutdown");
        }
        info!("Alert pipeline stopped");

        result
    }
}

fn spawn_loop(
    tasks: &mut JoinSet<PipelineTask>,
    task_ids: &mut HashMap<tokio::task::Id, PipelineTask>,
    task: PipelineTask,
    evaluator: &Arc<AlertEvaluator>,
    dispatcher: &Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    let handle = match task {
        PipelineTask::Evaluator => {
            let evaluator = Arc::clone(evaluator);
            tasks.spawn(async move {
                evaluator.run(cancel).await;
                PipelineTask::Evaluator
            })
        }
        PipelineTask::Dispatcher => {
            let dispatcher = Arc::clone(dispatcher);
            tasks.spawn(async move {
                dispatcher.run(cancel).await;
                PipelineTask::Dispatcher
            })
        }
        PipelineTask::Registry => return,
    };
    task_ids.insert(handle.id(), task);
}

/// Supervise running tasks until shutdown or a fatal failure.
async fn supervise(
    tasks: &mut JoinSet<PipelineTask>,
    task_ids: &mut HashMap<tokio::task::Id, PipelineTask>,
    evaluator: &Arc<AlertEvaluator>,
    dispatcher: &Arc<Dispatcher>,
    shutdown: &CancellationToken,
) -> Result<(), EngineError> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, waiting for current cycles");
                return Ok(());
            }
            Some(result) = tasks.join_next_with_id() => {
                match result {
                    Ok((task_id, task)) => {
                        task_ids.remove(&task_id);
                        if !shutdown.is_cancelled() {
                            warn!(task = task.name(), "Pipeline task exited unexpectedly");
                        }
                    }
                    Err(join_error) if join_error.is_panic() => {
                        let task = task_ids.remove(&join_error.id());
                        let name = task.map_or("unknown", PipelineTask::name);
                        error!(task = name, error = %join_error, "Pipeline task panicked");
                        metrics::counter!("alertd_task_panics_total", "task" => name).increment(1);

                        match task {
                            Some(task @ (PipelineTask::Evaluator | PipelineTask::Dispatcher)) => {
                                info!(
                                    task = name,
                                    delay_secs = PANIC_RESTART_DELAY.as_secs(),
                                    "Respawning task after panic delay"
                                );
                                tokio::select! {
                                    _ = shutdown.cancelled() => return Ok(()),
                                    _ = tokio::time::sleep(PANIC_RESTART_DELAY) => {}
                                }
                                spawn_loop(tasks, task_ids, task, evaluator, dispatcher, shutdown.clone());
                                info!(task = name, "Task respawned after panic");
                            }
                            _ => {
                                return Err(EngineError::TaskFailed {
                                    task: name,
                                    message: join_error.to_string(),
                                });
                            }
                        }
                    }
                    Err(join_error) => {
                        tracing::debug!(error = %join_error, "Pipeline task cancelled");
                        task_ids.remove(&join_error.id());
                    }
                }

                if tasks.is_empty() {
                    warn!("All pipeline tasks completed unexpectedly");
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for AlertPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertPipeline")
            .field("evaluator", &self.evaluator)
            .field("dispatcher", &self.dispatcher)
            .field("subscribers", &self.registry.len())
            .finish()
    }
}
