//! Notification queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use super::AlertEvent;

/// FIFO buffer of alert events pending delivery.
///
/// The deduplicator appends at the tail, the dispatcher pops batches from the
/// head and pushes failed events back at the tail. Unbounded by default; with
/// a `max_len`, pushing onto a full queue drops the oldest event.
///
/// # Thread Safety
///
/// The queue is `Clone + Send + Sync`; clones share the same buffer.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    inner: Arc<Mutex<VecDeque<AlertEvent>>>,
    max_len: Option<usize>,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl NotificationQueue {
    /// Create an unbounded queue.
    pub fn unbounded() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            max_len: None,
        }
    }

    /// Create a queue holding at most `max_len` events (drop oldest).
    pub fn bounded(max_len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(max_len.min(1024)))),
            max_len: Some(max_len.max(1)),
        }
    }

    /// Create a queue from an optional bound.
    pub fn new(max_len: Option<usize>) -> Self {
        match max_len {
            Some(n) => Self::bounded(n),
            None => Self::unbounded(),
        }
    }

    /// Append an event at the tail. Never blocks.
    pub fn push(&self, event: AlertEvent) {
        self.push_all(std::iter::once(event));
    }

    /// Append events at the tail, in order.
    ///
    /// Used both for fresh events and to requeue events after a failed send.
    pub fn push_all(&self, events: impl IntoIterator<Item = AlertEvent>) {
        let mut dropped = 0u64;
        let len = {
            let mut queue = self.lock();
            for event in events {
                if let Some(max) = self.max_len
                    && queue.len() >= max
                {
                    if let Some(old) = queue.pop_front() {
                        tracing::warn!(
                            event_id = %old.id,
                            rule_id = %old.rule_id,
                            "Queue full, dropping oldest alert"
                        );
                        dropped += 1;
                    }
                }
                tracing::trace!(event_id = %event.id, rule_id = %event.rule_id, "Enqueueing alert");
                queue.push_back(event);
            }
            queue.len()
        };

        if dropped > 0 {
            metrics::counter!("alertd_alerts_dropped_total").increment(dropped);
        }
        metrics::gauge!("alertd_queue_size").set(len as f64);
    }

    /// Pop up to `max` events from the head.
    pub fn pop_batch(&self, max: usize) -> Vec<AlertEvent> {
        let (batch, len) = {
            let mut queue = self.lock();
            let n = max.min(queue.len());
            let batch: Vec<AlertEvent> = queue.drain(..n).collect();
            (batch, queue.len())
        };
        metrics::gauge!("alertd_queue_size").set(len as f64);
        batch
    }

    /// Discard everything still queued, returning how many events were dropped.
    pub fn clear(&self) -> usize {
        let n = {
            let mut queue = self.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        metrics::gauge!("alertd_queue_size").set(0.0);
        n
    }

    /// Get the current number of queued events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ids of the queued events, head first.
    pub fn ids(&self) -> Vec<uuid::Uuid> {
        self.lock().iter().map(|e| e.id).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AlertEvent>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Severity;

    fn event(rule_id: &str) -> AlertEvent {
        AlertEvent::test_event(rule_id, Severity::Warning)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = NotificationQueue::unbounded();
        queue.push(event("a"));
        queue.push(event("b"));
        queue.push(event("c"));

        let batch = queue.pop_batch(10);
        let ids: Vec<_> = batch.iter().map(|e| e.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_batch_respects_batch_size() {
        let queue = NotificationQueue::unbounded();
        for i in 0..250 {
            queue.push(event(&format!("r{}", i)));
        }

        assert_eq!(queue.pop_batch(100).len(), 100);
        assert_eq!(queue.len(), 150);
        let next = queue.pop_batch(100);
        assert_eq!(next[0].rule_id, "r100");
    }

    #[test]
    fn pop_batch_on_empty_queue() {
        let queue = NotificationQueue::unbounded();
        assert!(queue.pop_batch(100).is_empty());
    }

    #[test]
    fn requeue_goes_to_tail() {
        let queue = NotificationQueue::unbounded();
        queue.push(event("a"));
        queue.push(event("b"));

        let batch = queue.pop_batch(1);
        queue.push(event("c"));
        queue.push_all(batch);

        let order: Vec<_> = queue
            .pop_batch(10)
            .into_iter()
            .map(|e| e.rule_id)
            .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn bounded_queue_drops_oldest() {
        let queue = NotificationQueue::bounded(2);
        queue.push(event("a"));
        queue.push(event("b"));
        queue.push(event("c"));

        assert_eq!(queue.len(), 2);
        let order: Vec<_> = queue
            .pop_batch(10)
            .into_iter()
            .map(|e| e.rule_id)
            .collect();
        assert_eq!(order, vec!["b", "c"]);
    }

    #[test]
    fn clones_share_the_same_buffer() {
        let queue = NotificationQueue::unbounded();
        let clone = queue.clone();
        clone.push(event("a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn clear_reports_discarded_count() {
        let queue = NotificationQueue::unbounded();
        queue.push(event("a"));
        queue.push(event("b"));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
