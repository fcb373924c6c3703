//! Bounded in-memory event history with status-tiered eviction.
//!
//! Eviction prefers completed events over started over pending, oldest
//! first within each tier, so in-flight work is never dropped while a
//! finished event could be evicted instead. Removal only drops the history
//! reference - an awaiter holding the event keeps it alive.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::event::{Event, EventId, EventStatus};

pub(crate) struct EventHistory {
    events: Mutex<HashMap<EventId, Event>>,
    max_size: Option<usize>,
}

impl EventHistory {
    pub(crate) fn new(max_size: Option<usize>) -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventId, Event>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(&self, event: Event) {
        self.lock().insert(event.id().to_string(), event);
    }

    pub(crate) fn get(&self, event_id: &str) -> Option<Event> {
        self.lock().get(event_id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// All events currently retained.
    pub(crate) fn snapshot(&self) -> Vec<Event> {
        self.lock().values().cloned().collect()
    }

    /// Events whose status matches, creation order.
    pub(crate) fn with_status(&self, status: EventStatus) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .snapshot()
            .into_iter()
            .filter(|event| event.status() == status)
            .collect();
        events.sort_by_key(|event| event.created_at());
        events
    }

    /// Events that have not settled (still count against capacity).
    pub(crate) fn processing_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|event| event.status() != EventStatus::Completed)
            .count()
    }

    /// Evict down to the configured bound. Returns how many were removed.
    pub(crate) fn evict(&self) -> usize {
        let Some(max_size) = self.max_size else {
            return 0;
        };
        let mut events = self.lock();
        if events.len() <= max_size {
            return 0;
        }
        let mut remaining = events.len() - max_size;

        let mut victims: Vec<EventId> = Vec::with_capacity(remaining);
        for status in [
            EventStatus::Completed,
            EventStatus::Started,
            EventStatus::Pending,
        ] {
            if remaining == 0 {
                break;
            }
            let mut tier: Vec<&Event> = events
                .values()
                .filter(|event| event.status() == status)
                .collect();
            // Ties on created_at break by id: UUIDv7 ids order by time.
            tier.sort_by(|a, b| {
                a.created_at()
                    .cmp(&b.created_at())
                    .then_with(|| a.id().cmp(b.id()))
            });
            let take = remaining.min(tier.len());
            victims.extend(tier.into_iter().take(take).map(|e| e.id().to_string()));
            remaining -= take;
        }

        for id in &victims {
            events.remove(id);
        }
        if !victims.is_empty() {
            debug!(
                evicted = victims.len(),
                retained = events.len(),
                "trimmed event history"
            );
        }
        victims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::EventResult;

    fn completed_event(name: &str) -> Event {
        let event = Event::new(name).build();
        event.mark_complete_if_settled();
        event
    }

    fn started_event(name: &str) -> Event {
        let event = Event::new(name).build();
        let result = EventResult::new(&event, format!("b.{name}"), name, "b", "bus", None);
        result.mark_started();
        event.add_result(result);
        event
    }

    #[test]
    fn test_insert_get_len() {
        let history = EventHistory::new(Some(10));
        let event = Event::new("E").build();
        history.insert(event.clone());
        assert_eq!(history.len(), 1);
        assert_eq!(history.get(event.id()).unwrap().id(), event.id());
        assert!(history.get("missing").is_none());
    }

    #[test]
    fn test_eviction_keeps_most_recent_completed() {
        let history = EventHistory::new(Some(2));
        let first = completed_event("First");
        let second = completed_event("Second");
        let third = completed_event("Third");
        for event in [&first, &second, &third] {
            history.insert((*event).clone());
        }

        assert_eq!(history.evict(), 1);
        assert!(history.get(first.id()).is_none());
        assert!(history.get(second.id()).is_some());
        assert!(history.get(third.id()).is_some());
    }

    #[test]
    fn test_eviction_prefers_completed_over_in_flight() {
        let history = EventHistory::new(Some(2));
        // Oldest event is still running; a newer completed one exists.
        let running = started_event("Running");
        let done_one = completed_event("DoneOne");
        let done_two = completed_event("DoneTwo");
        for event in [&running, &done_one, &done_two] {
            history.insert((*event).clone());
        }

        assert_eq!(history.evict(), 1);
        // The completed event went first even though the running one is older.
        assert!(history.get(running.id()).is_some());
        assert!(history.get(done_one.id()).is_none());
        assert!(history.get(done_two.id()).is_some());
    }

    #[test]
    fn test_eviction_falls_back_to_started_then_pending() {
        let history = EventHistory::new(Some(1));
        let pending = Event::new("Pending").build();
        let started = started_event("Started");
        history.insert(pending.clone());
        history.insert(started.clone());

        assert_eq!(history.evict(), 1);
        // No completed events: the started tier is drained before pending.
        assert!(history.get(started.id()).is_none());
        assert!(history.get(pending.id()).is_some());
    }

    #[test]
    fn test_unbounded_history_never_evicts() {
        let history = EventHistory::new(None);
        for n in 0..100 {
            history.insert(completed_event(&format!("E{n}")));
        }
        assert_eq!(history.evict(), 0);
        assert_eq!(history.len(), 100);
    }

    #[test]
    fn test_eviction_removes_reference_not_event() {
        let history = EventHistory::new(Some(1));
        let first = completed_event("First");
        history.insert(first.clone());
        history.insert(completed_event("Second"));
        history.evict();

        // Our handle still works after eviction.
        assert!(history.get(first.id()).is_none());
        assert_eq!(first.event_type(), "First");
        assert!(first.is_complete());
    }

    #[test]
    fn test_processing_count_ignores_completed() {
        let history = EventHistory::new(Some(10));
        history.insert(completed_event("Done"));
        history.insert(started_event("Running"));
        history.insert(Event::new("Queued").build());
        assert_eq!(history.processing_count(), 2);
    }
}
