//! Document Lifecycle
//!
//! Status state machine plus the retention queue for out-of-order
//! cancellation/replacement events. `Canceled` and `Replaced` are terminal:
//! once reached, no event moves a folio out of them.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentStatus {
    /// Parsed and verified but not yet stored.
    Pending,
    Valid,
    Canceled,
    Replaced,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Canceled | DocumentStatus::Replaced)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "Pending",
            DocumentStatus::Valid => "Valid",
            DocumentStatus::Canceled => "Canceled",
            DocumentStatus::Replaced => "Replaced",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an event does to its target folio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    Cancel,
    Replace,
}

impl LifecycleAction {
    pub fn resulting_status(&self) -> DocumentStatus {
        match self {
            LifecycleAction::Cancel => DocumentStatus::Canceled,
            LifecycleAction::Replace => DocumentStatus::Replaced,
        }
    }
}

/// A cancellation or replacement event acting on an existing folio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub target: Uuid,
    pub action: LifecycleAction,
    /// The folio that caused the transition: the replacing document, or the
    /// substitution folio named by a cancellation notice.
    pub actor: Option<Uuid>,
    pub effective_at: NaiveDateTime,
}

/// Compute the status transition an event produces. `None` means the event
/// is a no-op because the current status is terminal.
pub fn apply_transition(
    current: DocumentStatus,
    action: LifecycleAction,
) -> Option<DocumentStatus> {
    if current.is_terminal() {
        return None;
    }
    Some(action.resulting_status())
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    event: LifecycleEvent,
    queued_at: DateTime<Utc>,
}

/// Retention queue for events whose target folio has not been ingested yet.
/// Events are re-applied in arrival order when the folio appears; events
/// older than the retention window are dropped and counted as orphaned.
#[derive(Debug)]
pub struct DeferredEvents {
    retention: Duration,
    pending: HashMap<Uuid, Vec<QueuedEvent>>,
    orphaned: u64,
}

impl DeferredEvents {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            pending: HashMap::new(),
            orphaned: 0,
        }
    }

    /// Queue an event for a folio the store does not know yet.
    pub fn defer(&mut self, event: LifecycleEvent, now: DateTime<Utc>) {
        tracing::debug!(
            target_folio = %event.target,
            action = ?event.action,
            "deferring lifecycle event for unknown folio"
        );
        self.pending
            .entry(event.target)
            .or_default()
            .push(QueuedEvent {
                event,
                queued_at: now,
            });
    }

    /// Drain the still-live events queued against a folio, in arrival
    /// order. Expired entries are dropped and counted.
    pub fn take_for(&mut self, target: &Uuid, now: DateTime<Utc>) -> Vec<LifecycleEvent> {
        let Some(queued) = self.pending.remove(target) else {
            return Vec::new();
        };
        let mut live = Vec::with_capacity(queued.len());
        for entry in queued {
            if self.is_expired(&entry, now) {
                self.report_orphan(&entry);
            } else {
                live.push(entry.event);
            }
        }
        live
    }

    /// Sweep the whole queue, dropping expired events. Returns how many
    /// were dropped.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let retention = self.retention;
        let mut dropped = 0;
        let mut orphans = Vec::new();
        self.pending.retain(|_, entries| {
            entries.retain(|entry| {
                let expired = now - entry.queued_at > retention;
                if expired {
                    orphans.push(entry.clone());
                }
                !expired
            });
            !entries.is_empty()
        });
        for entry in orphans {
            self.report_orphan(&entry);
            dropped += 1;
        }
        dropped
    }

    /// Events currently waiting for their target.
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total events dropped after outliving the retention window.
    pub fn orphaned_total(&self) -> u64 {
        self.orphaned
    }

    fn is_expired(&self, entry: &QueuedEvent, now: DateTime<Utc>) -> bool {
        now - entry.queued_at > self.retention
    }

    fn report_orphan(&mut self, entry: &QueuedEvent) {
        self.orphaned += 1;
        tracing::warn!(
            target_folio = %entry.event.target,
            action = ?entry.event.action,
            queued_at = %entry.queued_at,
            "dropping orphaned lifecycle event past retention window"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(target: Uuid) -> LifecycleEvent {
        LifecycleEvent {
            target,
            action: LifecycleAction::Cancel,
            actor: None,
            effective_at: NaiveDateTime::parse_from_str(
                "2024-04-01T09:00:00",
                "%Y-%m-%dT%H:%M:%S",
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_transitions_from_valid() {
        assert_eq!(
            apply_transition(DocumentStatus::Valid, LifecycleAction::Cancel),
            Some(DocumentStatus::Canceled)
        );
        assert_eq!(
            apply_transition(DocumentStatus::Valid, LifecycleAction::Replace),
            Some(DocumentStatus::Replaced)
        );
    }

    #[test]
    fn test_terminal_states_do_not_regress() {
        assert_eq!(
            apply_transition(DocumentStatus::Canceled, LifecycleAction::Replace),
            None
        );
        assert_eq!(
            apply_transition(DocumentStatus::Replaced, LifecycleAction::Cancel),
            None
        );
    }

    #[test]
    fn test_defer_and_take() {
        let mut queue = DeferredEvents::new(Duration::days(30));
        let target = Uuid::new_v4();
        let now = Utc::now();

        queue.defer(event(target), now);
        assert_eq!(queue.len(), 1);

        let taken = queue.take_for(&target, now + Duration::hours(1));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].target, target);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_preserves_arrival_order() {
        let mut queue = DeferredEvents::new(Duration::days(30));
        let target = Uuid::new_v4();
        let now = Utc::now();

        let mut first = event(target);
        first.action = LifecycleAction::Replace;
        queue.defer(first, now);
        queue.defer(event(target), now + Duration::seconds(1));

        let taken = queue.take_for(&target, now + Duration::hours(1));
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].action, LifecycleAction::Replace);
        assert_eq!(taken[1].action, LifecycleAction::Cancel);
    }

    #[test]
    fn test_expired_events_are_orphaned() {
        let mut queue = DeferredEvents::new(Duration::days(30));
        let target = Uuid::new_v4();
        let now = Utc::now();

        queue.defer(event(target), now);
        let dropped = queue.expire(now + Duration::days(31));
        assert_eq!(dropped, 1);
        assert_eq!(queue.orphaned_total(), 1);
        assert!(queue.take_for(&target, now + Duration::days(31)).is_empty());
    }

    #[test]
    fn test_take_drops_expired_entries() {
        let mut queue = DeferredEvents::new(Duration::days(30));
        let target = Uuid::new_v4();
        let now = Utc::now();

        queue.defer(event(target), now);
        let taken = queue.take_for(&target, now + Duration::days(31));
        assert!(taken.is_empty());
        assert_eq!(queue.orphaned_total(), 1);
    }
}
