//! Bounded FIFO intake queue with graceful shutdown.
//!
//! Producers push synchronously (dispatch never awaits); the single
//! consumer polls with a bound so the run loop periodically re-evaluates
//! idle state. Shutdown wakes every waiter instead of leaving them parked
//! on a dead queue.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::BusError;
use crate::event::Event;

/// Outcome of a bounded poll.
pub(crate) enum Pop {
    /// The next event, in FIFO order.
    Item(Event),
    /// Nothing arrived within the poll bound.
    Idle,
    /// The queue was shut down and is drained.
    Shutdown,
}

struct QueueState {
    items: VecDeque<Event>,
    shutdown: bool,
}

pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without blocking. Fails loudly when shut down or full.
    pub(crate) fn push(&self, event: Event) -> Result<(), BusError> {
        {
            let mut state = self.lock();
            if state.shutdown {
                return Err(BusError::QueueShutdown);
            }
            if state.items.len() >= self.capacity {
                return Err(BusError::CapacityExceeded {
                    queued: state.items.len(),
                    processing: 0,
                    limit: self.capacity,
                });
            }
            state.items.push_back(event);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next event, waiting at most `poll` for one to arrive.
    pub(crate) async fn pop(&self, poll: Duration) -> Pop {
        loop {
            // Register before checking so a push between the check and the
            // await cannot be missed.
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(event) = state.items.pop_front() {
                    return Pop::Item(event);
                }
                if state.shutdown {
                    return Pop::Shutdown;
                }
            }
            if tokio::time::timeout(poll, notified).await.is_err() {
                return Pop::Idle;
            }
        }
    }

    /// Dequeue immediately if an event is ready.
    pub(crate) fn try_pop(&self) -> Option<Event> {
        self.lock().items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting events and wake every parked consumer.
    pub(crate) fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32) -> Event {
        Event::new(format!("E{n}")).build()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EventQueue::new(10);
        queue.push(event(1)).unwrap();
        queue.push(event(2)).unwrap();
        queue.push(event(3)).unwrap();

        for expected in ["E1", "E2", "E3"] {
            match queue.pop(Duration::from_millis(10)).await {
                Pop::Item(e) => assert_eq!(e.event_type(), expected),
                _ => panic!("expected item"),
            }
        }
    }

    #[tokio::test]
    async fn test_pop_times_out_to_idle() {
        let queue = EventQueue::new(10);
        assert!(matches!(queue.pop(Duration::from_millis(10)).await, Pop::Idle));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(EventQueue::new(10));
        let consumer = queue.clone();
        let handle =
            tokio::spawn(async move { consumer.pop(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.push(event(1)).unwrap();
        assert!(matches!(handle.await.unwrap(), Pop::Item(_)));
    }

    #[test]
    fn test_push_full_fails_loudly() {
        let queue = EventQueue::new(2);
        queue.push(event(1)).unwrap();
        queue.push(event(2)).unwrap();
        let err = queue.push(event(3)).unwrap_err();
        assert!(matches!(err, BusError::CapacityExceeded { queued: 2, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_reports() {
        let queue = EventQueue::new(10);
        queue.push(event(1)).unwrap();
        queue.shutdown();

        // Still drains queued items before reporting shutdown.
        assert!(matches!(
            queue.pop(Duration::from_millis(10)).await,
            Pop::Item(_)
        ));
        assert!(matches!(
            queue.pop(Duration::from_millis(10)).await,
            Pop::Shutdown
        ));
        assert!(matches!(queue.push(event(2)), Err(BusError::QueueShutdown)));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_parked_consumer() {
        let queue = std::sync::Arc::new(EventQueue::new(10));
        let consumer = queue.clone();
        let handle =
            tokio::spawn(async move { consumer.pop(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.shutdown();
        assert!(matches!(handle.await.unwrap(), Pop::Shutdown));
    }
}
