//! Subscriber channel abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::AlertEvent;
use crate::error::DeliveryError;

/// One message sent to one subscriber: its matching subset of a dispatch batch.
#[derive(Debug, Clone, Serialize)]
pub struct AlertBatch {
    pub sent_at: DateTime<Utc>,
    pub alerts: Vec<AlertEvent>,
}

impl AlertBatch {
    pub fn new(alerts: Vec<AlertEvent>) -> Self {
        Self {
            sent_at: Utc::now(),
            alerts,
        }
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

/// A live delivery channel to one subscriber.
///
/// The core treats a channel as an opaque sink plus a liveness signal.
/// Implementations must be `Send + Sync` to work across async tasks and
/// must not retry internally: a failed send is requeued by the dispatcher.
///
/// # Example
///
/// ```ignore
/// use alertd::notify::{AlertBatch, SubscriberChannel};
///
/// struct LogChannel;
///
/// #[async_trait]
/// impl SubscriberChannel for LogChannel {
///     fn channel_type(&self) -> &str { "log" }
///     fn is_open(&self) -> bool { true }
///     async fn send(&self, batch: &AlertBatch) -> Result<(), DeliveryError> {
///         tracing::info!(count = batch.len(), "batch");
///         Ok(())
///     }
///     async fn closed(&self) { std::future::pending().await }
/// }
/// ```
#[async_trait]
pub trait SubscriberChannel: Send + Sync {
    /// Type of the channel (e.g., "mpsc", "webhook").
    fn channel_type(&self) -> &str;

    /// Whether the channel can currently accept a send.
    fn is_open(&self) -> bool;

    /// Send one batch as a single message. Single attempt.
    async fn send(&self, batch: &AlertBatch) -> Result<(), DeliveryError>;

    /// Resolve once the channel has closed or errored.
    ///
    /// Channels with no liveness signal never resolve.
    async fn closed(&self);
}

impl std::fmt::Debug for dyn SubscriberChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberChannel")
            .field("type", &self.channel_type())
            .field("open", &self.is_open())
            .finish()
    }
}

/// In-process channel backed by a bounded tokio mpsc.
///
/// The receiving half is the subscriber. Dropping the receiver closes the
/// channel, which the registry observes through [`SubscriberChannel::closed`].
/// Embedders bridge their own transport (e.g. a WebSocket writer task) by
/// draining the receiver.
#[derive(Debug, Clone)]
pub struct MpscChannel {
    tx: mpsc::Sender<AlertBatch>,
}

impl MpscChannel {
    /// Create a channel and its receiving half.
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<AlertBatch>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SubscriberChannel for MpscChannel {
    fn channel_type(&self) -> &str {
        "mpsc"
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&self, batch: &AlertBatch) -> Result<(), DeliveryError> {
        // Never wait on a slow receiver: a full buffer is a failed send.
        self.tx.try_send(batch.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => DeliveryError::ChannelClosed,
            mpsc::error::TrySendError::Full(_) => {
                DeliveryError::SendFailed("receiver buffer full".to_string())
            }
        })
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}
