//! Per-rule cooldown gate between evaluation and delivery.
//!
//! One [`RuleFiringState`] per rule id, created lazily on first firing and
//! kept for the process lifetime (bounded by the fixed rule count).
//!
//! # Gate
//!
//! A firing of rule R is forwarded to the notification queue when R has no
//! state, its state is inactive, or strictly more than `cooldown` has
//! elapsed since its last forwarded firing. Otherwise it is dropped and
//! R's repeat counter goes up; `last_triggered` does not move.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AckError;
use crate::notify::{AlertEvent, NotificationQueue};

/// Who acknowledged an active firing, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub by: String,
    pub at: DateTime<Utc>,
}

/// Mutable firing record of one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFiringState {
    pub active: bool,
    /// Time of the last forwarded firing.
    pub last_triggered: DateTime<Utc>,
    /// Firings suppressed since `last_triggered`.
    pub repeat_count: u64,
    pub acknowledged: Option<Acknowledgement>,
    /// Value observed on the most recent firing, forwarded or not.
    pub last_value: f64,
}

/// Outcome of offering an event to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Forwarded,
    Suppressed { repeat_count: u64 },
}

/// Cooldown deduplicator.
///
/// Owns a handle to the notification queue and forwards admitted events
/// itself, so the evaluator never touches the queue.
#[derive(Debug)]
pub struct Deduplicator {
    cooldown: Duration,
    states: Mutex<HashMap<String, RuleFiringState>>,
    queue: NotificationQueue,
}

impl Deduplicator {
    pub fn new(cooldown: Duration, queue: NotificationQueue) -> Self {
        Self {
            cooldown,
            states: Mutex::new(HashMap::new()),
            queue,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Offer a firing observed at `now`.
    pub fn admit(&self, event: AlertEvent, now: DateTime<Utc>) -> Admission {
        let admission = {
            let mut states = self.lock();
            let suppressed = match states.get_mut(&event.rule_id) {
                Some(state) if state.active && !self.cooldown_elapsed(state, now) => {
                    state.repeat_count += 1;
                    state.last_value = event.value;
                    Some(state.repeat_count)
                }
                _ => None,
            };
            match suppressed {
                Some(repeat_count) => Admission::Suppressed { repeat_count },
                None => {
                    states.insert(
                        event.rule_id.clone(),
                        RuleFiringState {
                            active: true,
                            last_triggered: now,
                            repeat_count: 0,
                            acknowledged: None,
                            last_value: event.value,
                        },
                    );
                    Admission::Forwarded
                }
            }
        };

        match admission {
            Admission::Forwarded => {
                tracing::info!(
                    rule_id = %event.rule_id,
                    severity = %event.severity,
                    value = event.value,
                    threshold = event.threshold,
                    "Alert fired"
                );
                metrics::counter!("alertd_alerts_fired_total", "rule_id" => event.rule_id.clone())
                    .increment(1);
                self.queue.push(event);
            }
            Admission::Suppressed { repeat_count } => {
                tracing::debug!(
                    rule_id = %event.rule_id,
                    repeat_count,
                    "Alert suppressed within cooldown"
                );
                metrics::counter!("alertd_alerts_suppressed_total", "rule_id" => event.rule_id)
                    .increment(1);
            }
        }

        admission
    }

    // Strictly greater: a firing exactly one cooldown later is still suppressed.
    fn cooldown_elapsed(&self, state: &RuleFiringState, now: DateTime<Utc>) -> bool {
        let elapsed = (now - state.last_triggered)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed > self.cooldown
    }

    /// Mark an active rule as resolved. Returns whether a transition happened.
    pub fn resolve(&self, rule_id: &str) -> bool {
        let resolved = {
            let mut states = self.lock();
            match states.get_mut(rule_id) {
                Some(state) if state.active => {
                    state.active = false;
                    true
                }
                _ => false,
            }
        };

        if resolved {
            tracing::info!(rule_id = %rule_id, "Alert resolved");
            metrics::counter!("alertd_alerts_resolved_total", "rule_id" => rule_id.to_string())
                .increment(1);
        }
        resolved
    }

    /// Record an acknowledgement on an active firing.
    ///
    /// Cleared when the next notification for that rule is forwarded.
    pub fn acknowledge(
        &self,
        rule_id: &str,
        by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AckError> {
        let mut states = self.lock();
        let state = states
            .get_mut(rule_id)
            .ok_or_else(|| AckError::UnknownRule(rule_id.to_string()))?;
        if !state.active {
            return Err(AckError::NotActive(rule_id.to_string()));
        }

        let by = by.into();
        tracing::info!(rule_id = %rule_id, by = %by, "Alert acknowledged");
        state.acknowledged = Some(Acknowledgement { by, at: now });
        Ok(())
    }

    /// Copy of the state of one rule, if it ever fired.
    pub fn state(&self, rule_id: &str) -> Option<RuleFiringState> {
        self.lock().get(rule_id).cloned()
    }

    /// Copy of every known state, sorted by rule id.
    pub fn states(&self) -> Vec<(String, RuleFiringState)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RuleFiringState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Severity;
    use chrono::TimeZone;

    const COOLDOWN: Duration = Duration::from_secs(30);

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn setup() -> (Deduplicator, NotificationQueue) {
        let queue = NotificationQueue::unbounded();
        (Deduplicator::new(COOLDOWN, queue.clone()), queue)
    }

    fn fire(dedup: &Deduplicator, rule: &str, at: DateTime<Utc>) -> Admission {
        dedup.admit(AlertEvent::test_event(rule, Severity::Critical), at)
    }

    #[test]
    fn first_firing_is_forwarded() {
        let (dedup, queue) = setup();
        assert_eq!(fire(&dedup, "cpu", t(0)), Admission::Forwarded);
        assert_eq!(queue.len(), 1);

        let state = dedup.state("cpu").unwrap();
        assert!(state.active);
        assert_eq!(state.last_triggered, t(0));
        assert_eq!(state.repeat_count, 0);
    }

    #[test]
    fn repeat_within_cooldown_is_suppressed() {
        let (dedup, queue) = setup();
        fire(&dedup, "cpu", t(0));
        assert_eq!(
            fire(&dedup, "cpu", t(10)),
            Admission::Suppressed { repeat_count: 1 }
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn n_suppressions_count_and_keep_last_triggered() {
        let (dedup, _queue) = setup();
        fire(&dedup, "cpu", t(0));
        for i in 1..=5 {
            fire(&dedup, "cpu", t(i * 5));
        }

        let state = dedup.state("cpu").unwrap();
        assert_eq!(state.repeat_count, 5);
        assert_eq!(state.last_triggered, t(0));
    }

    #[test]
    fn exactly_one_cooldown_later_is_suppressed() {
        let (dedup, _queue) = setup();
        fire(&dedup, "cpu", t(0));
        assert!(matches!(
            fire(&dedup, "cpu", t(30)),
            Admission::Suppressed { .. }
        ));
    }

    #[test]
    fn after_cooldown_fires_again_and_resets_counter() {
        let (dedup, queue) = setup();
        fire(&dedup, "cpu", t(0));
        fire(&dedup, "cpu", t(20));
        assert_eq!(fire(&dedup, "cpu", t(31)), Admission::Forwarded);
        assert_eq!(queue.len(), 2);

        let state = dedup.state("cpu").unwrap();
        assert_eq!(state.repeat_count, 0);
        assert_eq!(state.last_triggered, t(31));
    }

    #[test]
    fn inactive_state_fires_regardless_of_cooldown() {
        let (dedup, queue) = setup();
        fire(&dedup, "cpu", t(0));
        assert!(dedup.resolve("cpu"));
        assert_eq!(fire(&dedup, "cpu", t(5)), Admission::Forwarded);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn clock_going_backwards_counts_as_zero_elapsed() {
        let (dedup, _queue) = setup();
        fire(&dedup, "cpu", t(100));
        assert!(matches!(
            fire(&dedup, "cpu", t(0)),
            Admission::Suppressed { .. }
        ));
    }

    #[test]
    fn rules_are_independent() {
        let (dedup, queue) = setup();
        fire(&dedup, "cpu", t(0));
        assert_eq!(fire(&dedup, "mem", t(1)), Admission::Forwarded);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn resolve_only_transitions_active_states() {
        let (dedup, _queue) = setup();
        assert!(!dedup.resolve("never_fired"));
        fire(&dedup, "cpu", t(0));
        assert!(dedup.resolve("cpu"));
        assert!(!dedup.resolve("cpu"));
        assert!(!dedup.state("cpu").unwrap().active);
    }

    #[test]
    fn acknowledge_active_firing() {
        let (dedup, _queue) = setup();
        fire(&dedup, "cpu", t(0));
        dedup.acknowledge("cpu", "alice", t(5)).unwrap();

        let ack = dedup.state("cpu").unwrap().acknowledged.unwrap();
        assert_eq!(ack.by, "alice");
        assert_eq!(ack.at, t(5));
    }

    #[test]
    fn acknowledge_errors() {
        let (dedup, _queue) = setup();
        assert_eq!(
            dedup.acknowledge("cpu", "bob", t(0)),
            Err(AckError::UnknownRule("cpu".to_string()))
        );
        fire(&dedup, "cpu", t(0));
        dedup.resolve("cpu");
        assert_eq!(
            dedup.acknowledge("cpu", "bob", t(1)),
            Err(AckError::NotActive("cpu".to_string()))
        );
    }

    #[test]
    fn acknowledgement_cleared_by_next_forward() {
        let (dedup, _queue) = setup();
        fire(&dedup, "cpu", t(0));
        dedup.acknowledge("cpu", "alice", t(1)).unwrap();

        fire(&dedup, "cpu", t(10));
        assert!(dedup.state("cpu").unwrap().acknowledged.is_some());

        fire(&dedup, "cpu", t(45));
        assert!(dedup.state("cpu").unwrap().acknowledged.is_none());
    }
}
