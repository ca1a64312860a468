//! Subscriber registry and lifecycle.
//!
//! The registry is the only authority over which subscribers exist. The
//! transport side registers through a [`RegistryHandle`]. Removal has a
//! single path: each channel's own close signal is turned into a
//! [`RegistryEvent::Closed`] by a watcher task. The dispatcher only ever reads
//! a [`SubscriberRegistry::snapshot`]; it never adds or removes entries.
//!
//! Every registration gets a generation number, so a close signal from a
//! channel that has since been replaced under the same id is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;
use crate::notify::{AlertEvent, SubscriberChannel};
use crate::rules::{Labels, Severity};

/// Buffer of the registry event channel.
const REGISTRY_EVENT_BUFFER: usize = 64;

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFilter {
    pub severities: HashSet<Severity>,
    /// Every pair must be present and equal in the event labels.
    pub labels: Labels,
}

impl Default for SubscriberFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl SubscriberFilter {
    /// Accept every severity, no label requirement.
    pub fn all() -> Self {
        Self::severities([Severity::Info, Severity::Warning, Severity::Critical])
    }

    pub fn severities(severities: impl IntoIterator<Item = Severity>) -> Self {
        Self {
            severities: severities.into_iter().collect(),
            labels: Labels::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, event: &AlertEvent) -> bool {
        self.severities.contains(&event.severity)
            && self
                .labels
                .iter()
                .all(|(k, v)| event.labels.get(k) == Some(v))
    }
}

/// A registered subscriber.
pub struct Subscriber {
    pub id: String,
    pub filter: SubscriberFilter,
    pub channel: Arc<dyn SubscriberChannel>,
    generation: u64,
    watcher: CancellationToken,
}

impl Subscriber {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("channel", &self.channel.channel_type())
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    subscribers: HashMap<String, Arc<Subscriber>>,
    next_generation: u64,
}

/// Shared set of live subscribers.
///
/// Cheap to clone; clones share the same set.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<RegistryState>>,
    max_subscribers: Option<usize>,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("len", &self.len())
            .field("max_subscribers", &self.max_subscribers)
            .finish()
    }
}

impl SubscriberRegistry {
    pub fn new(max_subscribers: Option<usize>) -> Self {
        Self {
            inner: Arc::default(),
            max_subscribers,
        }
    }

    /// Register a subscriber, replacing any entry with the same id.
    ///
    /// Outside the crate registration goes through [`RegistryHandle`], so
    /// every channel gets a close watcher. Entries added here before the
    /// worker starts are picked up by [`RegistryWorker::run`].
    ///
    /// # Errors
    ///
    /// [`RegistryError::CapacityReached`] when adding a new id would exceed
    /// `max_subscribers`. Replacing an existing id is always allowed.
    pub(crate) fn subscribe(
        &self,
        id: impl Into<String>,
        channel: Arc<dyn SubscriberChannel>,
        filter: SubscriberFilter,
    ) -> Result<Arc<Subscriber>, RegistryError> {
        let id = id.into();
        let (subscriber, replaced, len) = {
            let mut state = self.lock();

            if let Some(limit) = self.max_subscribers
                && !state.subscribers.contains_key(&id)
                && state.subscribers.len() >= limit
            {
                tracing::warn!(subscriber_id = %id, limit, "Subscriber limit reached, rejecting");
                return Err(RegistryError::CapacityReached { limit });
            }

            state.next_generation += 1;
            let subscriber = Arc::new(Subscriber {
                id: id.clone(),
                filter,
                channel,
                generation: state.next_generation,
                watcher: CancellationToken::new(),
            });
            let replaced = state.subscribers.insert(id.clone(), subscriber.clone());
            (subscriber, replaced, state.subscribers.len())
        };

        if let Some(old) = &replaced {
            old.watcher.cancel();
        }
        tracing::info!(
            subscriber_id = %id,
            channel = %subscriber.channel.channel_type(),
            replaced = replaced.is_some(),
            "Subscriber registered"
        );
        metrics::gauge!("alertd_subscribers_connected").set(len as f64);

        Ok(subscriber)
    }

    /// Remove `id` only if it is still the registration with `generation`.
    pub(crate) fn remove_generation(&self, id: &str, generation: u64) -> bool {
        let (removed, len) = {
            let mut state = self.lock();
            let removed = if state
                .subscribers
                .get(id)
                .is_some_and(|s| s.generation == generation)
            {
                state.subscribers.remove(id)
            } else {
                None
            };
            (removed, state.subscribers.len())
        };

        match removed {
            Some(subscriber) => {
                subscriber.watcher.cancel();
                tracing::info!(subscriber_id = %id, "Subscriber removed");
                metrics::gauge!("alertd_subscribers_connected").set(len as f64);
                true
            }
            None => false,
        }
    }

    /// Stable copy of the current subscribers.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        let mut subscribers: Vec<_> = self.lock().subscribers.values().cloned().collect();
        subscribers.sort_by(|a, b| a.id.cmp(&b.id));
        subscribers
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().subscribers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Messages handled by the registry task.
pub enum RegistryEvent {
    Subscribe {
        id: String,
        channel: Arc<dyn SubscriberChannel>,
        filter: SubscriberFilter,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    /// The channel of registration `generation` closed or errored.
    Closed {
        id: String,
        generation: u64,
    },
}

impl std::fmt::Debug for RegistryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryEvent::Subscribe { id, .. } => write!(f, "Subscribe({})", id),
            RegistryEvent::Closed { id, generation } => {
                write!(f, "Closed({}, gen {})", id, generation)
            }
        }
    }
}

/// Transport-facing handle to the registry task.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryEvent>,
}

impl RegistryHandle {
    /// Register (or replace) a subscriber and wait for the registry's answer.
    pub async fn subscribe(
        &self,
        id: impl Into<String>,
        channel: Arc<dyn SubscriberChannel>,
        filter: SubscriberFilter,
    ) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryEvent::Subscribe {
                id: id.into(),
                channel,
                filter,
                reply,
            })
            .await
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)?
    }
}

/// Task applying [`RegistryEvent`]s to a [`SubscriberRegistry`].
pub struct RegistryWorker {
    registry: SubscriberRegistry,
    rx: mpsc::Receiver<RegistryEvent>,
    /// Cloned into watchers so they can report closes.
    tx: mpsc::Sender<RegistryEvent>,
}

impl std::fmt::Debug for RegistryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryWorker")
            .field("registry", &self.registry)
            .finish()
    }
}

impl RegistryWorker {
    /// Create the worker and the handle used to reach it.
    pub fn new(registry: SubscriberRegistry) -> (Self, RegistryHandle) {
        let (tx, rx) = mpsc::channel(REGISTRY_EVENT_BUFFER);
        let handle = RegistryHandle { tx: tx.clone() };
        (Self { registry, rx, tx }, handle)
    }

    /// Process events until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::debug!("Registry worker started");

        // Registrations made before the worker started.
        for subscriber in self.registry.snapshot() {
            self.watch(subscriber, &cancel);
        }

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event, &cancel),
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        tracing::debug!("Registry worker stopped");
    }

    fn handle(&self, event: RegistryEvent, cancel: &CancellationToken) {
        tracing::trace!(event = ?event, "Registry event");
        match event {
            RegistryEvent::Subscribe {
                id,
                channel,
                filter,
                reply,
            } => {
                let result = self
                    .registry
                    .subscribe(id, channel, filter)
                    .map(|subscriber| self.watch(subscriber, cancel));
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
            RegistryEvent::Closed { id, generation } => {
                if self.registry.remove_generation(&id, generation) {
                    tracing::info!(subscriber_id = %id, "Subscriber channel closed");
                } else {
                    tracing::debug!(subscriber_id = %id, generation, "Ignoring stale close");
                }
            }
        }
    }

    /// Spawn a task turning the channel's close signal into a `Closed` event.
    fn watch(&self, subscriber: Arc<Subscriber>, cancel: &CancellationToken) {
        let tx = self.tx.clone();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = subscriber.channel.closed() => {
                    let _ = tx
                        .send(RegistryEvent::Closed {
                            id: subscriber.id.clone(),
                            generation: subscriber.generation,
                        })
                        .await;
                }
                _ = subscriber.watcher.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }
}
