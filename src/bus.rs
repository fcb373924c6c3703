//! The event bus: handler registry, synchronous dispatch, one-shot
//! expectations, and lifecycle.
//!
//! A bus owns one FIFO intake queue and one single-consumer run loop.
//! Dispatch never awaits: it validates, enqueues, and hands back the same
//! (pending) event, which the caller may await for completion. The run
//! loop auto-starts on the first dispatch.
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{Event, EventBus, Handler, HandlerOutput};
//!
//! let bus = EventBus::builder("orders")
//!     .parallel_handlers(true)
//!     .wal_path("/var/log/orders.jsonl")
//!     .build();
//!
//! bus.on("OrderPlaced", Handler::new("reserve_stock", |event| async move {
//!     HandlerOutput::json(&"reserved")
//! }));
//!
//! let event = bus.dispatch(Event::new("OrderPlaced").build())?;
//! let value = event.results().first_value().await?;
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context;
use crate::error::BusError;
use crate::event::{is_identifier, Event, EventStatus};
use crate::handler::{Handler, HandlerOutput, Pattern};
use crate::history::EventHistory;
use crate::queue::EventQueue;
use crate::registry::registry;
use crate::wal::WalWriter;

/// Default bound on retained history per bus.
pub const DEFAULT_MAX_HISTORY: usize = 50;
/// Default ceiling on queued plus in-flight events per bus.
pub const DEFAULT_MAX_PENDING: usize = 100;
/// Default causal self-recursion bound for non-forwarding handlers.
pub const DEFAULT_RECURSION_LIMIT: usize = 2;
/// Default slow-handler watchdog delay.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(15);
/// Default per-event processing timeout.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(300);

/// How long the run loop waits for an event before re-evaluating idleness.
pub(crate) const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Grace given to a cancelled handler task before it is abandoned.
pub(crate) const CANCEL_GRACE: Duration = Duration::from_millis(100);
/// Grace given to the run loop and in-flight tasks during shutdown.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Per-bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Append completed events to this JSON Lines file.
    pub wal_path: Option<PathBuf>,
    /// Run one event's handlers concurrently instead of in registration
    /// order.
    pub parallel_handlers: bool,
    /// Bound on retained history; `None` retains everything.
    pub max_history_size: Option<usize>,
    /// Backpressure ceiling: dispatch fails once queued plus unsettled
    /// events reach this.
    pub max_pending_events: usize,
    /// Causal self-recursion bound for non-forwarding handlers.
    pub recursion_limit: usize,
    /// Slow-handler watchdog delay (logs, never cancels).
    pub watchdog_timeout: Duration,
    /// Timeout applied to handlers when neither the handler nor the event
    /// carries one. `None` disables the default.
    pub default_event_timeout: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            wal_path: None,
            parallel_handlers: false,
            max_history_size: Some(DEFAULT_MAX_HISTORY),
            max_pending_events: DEFAULT_MAX_PENDING,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            default_event_timeout: Some(DEFAULT_EVENT_TIMEOUT),
        }
    }
}

/// A handler bound to a bus, with its stable per-bus identity.
#[derive(Clone)]
pub(crate) struct RegisteredHandler {
    /// `"{bus id}.{handler registration id}"` - the same handler object
    /// registered on two buses gets two identities, so forwarding chains
    /// keep per-bus results distinct.
    pub(crate) id: String,
    pub(crate) handler: Handler,
}

pub(crate) struct BusCore {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) config: BusConfig,
    pub(crate) handlers: DashMap<String, Vec<RegisteredHandler>>,
    pub(crate) queue: EventQueue,
    pub(crate) history: EventHistory,
    pub(crate) wal: Option<WalWriter>,
    pub(crate) running: AtomicBool,
    pub(crate) idle: Notify,
    pub(crate) runloop: Mutex<Option<JoinHandle<()>>>,
    pub(crate) inflight: Mutex<Vec<AbortHandle>>,
}

/// A single-consumer event router owning one FIFO queue and a handler
/// registry. Cheap to clone; clones share the same bus.
#[derive(Clone)]
pub struct EventBus {
    pub(crate) core: Arc<BusCore>,
}

impl EventBus {
    /// Create a bus with default configuration.
    ///
    /// Names should be unique among live buses; a collision auto-suffixes
    /// with a warning rather than failing.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// Start building a configured bus.
    pub fn builder(name: impl Into<String>) -> EventBusBuilder {
        EventBusBuilder {
            name: name.into(),
            config: BusConfig::default(),
        }
    }

    pub(crate) fn from_core(core: Arc<BusCore>) -> Self {
        Self { core }
    }

    /// The bus's (possibly auto-suffixed) unique name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The bus's unique id.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Whether the run loop is active.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Subscribe a handler to events matching a pattern.
    ///
    /// The pattern is an exact event type (`"OrderPlaced"`),
    /// [`Pattern::of::<T>()`] for a typed payload, or `"*"` for everything.
    /// Registering `Handler::forward(&other)` under `"*"` chains buses.
    pub fn on(&self, pattern: impl Into<Pattern>, handler: Handler) {
        let pattern = pattern.into();
        if pattern.validate().is_err() {
            // A key that can never equal a valid event type never matches;
            // registration is kept so the caller can find it when debugging.
            warn!(
                bus = %self.core.name,
                pattern = %pattern,
                "pattern is not a valid event type and will never match"
            );
        }
        let key = pattern.key().to_string();
        let mut entry = self.core.handlers.entry(key.clone()).or_default();
        if entry.iter().any(|r| r.handler.name == handler.name) {
            warn!(
                bus = %self.core.name,
                pattern = %key,
                handler = %handler.name,
                "handler name already registered for this pattern, \
                 name-based result access will be ambiguous"
            );
        }
        debug!(
            bus = %self.core.name,
            pattern = %key,
            handler = %handler.name,
            "handler registered"
        );
        entry.push(RegisteredHandler {
            id: format!("{}.{}", self.core.id, handler.uid),
            handler,
        });
    }

    /// Remove one registration (used by `expect` cleanup).
    pub(crate) fn off(&self, pattern_key: &str, handler_uid: &str) {
        if let Some(mut entry) = self.core.handlers.get_mut(pattern_key) {
            entry.retain(|r| r.handler.uid != handler_uid);
        }
    }

    /// Total registered handlers across all patterns.
    pub fn handler_count(&self) -> usize {
        self.core.handlers.iter().map(|entry| entry.len()).sum()
    }

    /// Enqueue an event and return it immediately, still pending.
    ///
    /// The returned handle is the same event; await
    /// [`Event::wait`](crate::Event::wait) or use
    /// [`Event::results`](crate::Event::results) for the outcome.
    ///
    /// When called from inside a handler, the event is automatically
    /// parented to the enclosing event and recorded as a child of the
    /// enclosing handler's result.
    pub fn dispatch(&self, event: Event) -> Result<Event, BusError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BusError::NoRuntime);
        }
        if !is_identifier(event.event_type()) {
            return Err(BusError::Validation {
                message: format!(
                    "event type {:?} is not a valid identifier",
                    event.event_type()
                ),
            });
        }
        if !event.schema().contains('@') {
            return Err(BusError::Validation {
                message: format!("event schema {:?} is missing a version tag", event.schema()),
            });
        }

        // Causal bookkeeping for nested dispatch. Forwarding re-dispatches
        // the same event; that is routing, not causation, so it neither
        // re-parents nor child-tracks.
        if let Some(scope) = context::current_scope() {
            if scope.event.id() != event.id() {
                if event.parent_id().is_none() {
                    event.set_parent(scope.event.id().to_string());
                }
                if let Some(result) = scope.event.result_for(&scope.handler_id) {
                    result.add_child(event.clone());
                }
            }
        }

        if !event.push_path(&self.core.name) {
            debug!(
                bus = %self.core.name,
                event = %event,
                "bus already in event path, not appending"
            );
        }

        let queued = self.core.queue.len();
        let processing = self.core.history.processing_count();
        if queued + processing >= self.core.config.max_pending_events {
            return Err(BusError::CapacityExceeded {
                queued,
                processing,
                limit: self.core.config.max_pending_events,
            });
        }

        self.start()?;
        self.core.queue.push(event.clone())?;
        self.core.history.insert(event.clone());
        debug!(
            bus = %self.core.name,
            event = %event,
            queued = self.core.queue.len(),
            "event dispatched"
        );
        self.core.history.evict();
        Ok(event)
    }

    /// Start the run loop. Idempotent; dispatch calls this automatically.
    ///
    /// A stopped bus stays stopped: its queue is shut down and will not
    /// accept further events.
    pub fn start(&self) -> Result<(), BusError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BusError::NoRuntime);
        }
        if self.core.queue.is_shutdown() {
            return Err(BusError::QueueShutdown);
        }
        if self.core.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let bus = self.clone();
        let task = tokio::spawn(crate::engine::run_loop(bus));
        *self
            .core
            .runloop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        Ok(())
    }

    /// Stop the bus.
    ///
    /// With a timeout, waits up to that long for the queue to drain first.
    /// The loop then gets a short grace to exit before being aborted, and
    /// in-flight handler tasks are cancelled after the same grace. With
    /// `clear`, history and handlers are wiped and the bus is removed from
    /// the global registry.
    pub async fn stop(&self, timeout: Option<Duration>, clear: bool) {
        if !self.is_running() {
            return;
        }
        if let Some(limit) = timeout {
            if !limit.is_zero() {
                let _ = self.wait_until_idle(Some(limit)).await;
            }
        }

        let queued = self.core.queue.len();
        let processing = self.core.history.processing_count();
        if queued > 0 || processing > 0 {
            debug!(
                bus = %self.core.name,
                queued,
                processing,
                "stopping with unfinished events"
            );
        }

        self.core.running.store(false, Ordering::Release);
        self.core.queue.shutdown();

        let task = self
            .core
            .runloop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        let live: Vec<AbortHandle> = {
            let mut inflight = self
                .core
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inflight.drain(..).filter(|h| !h.is_finished()).collect()
        };
        if !live.is_empty() {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            for handle in live {
                handle.abort();
            }
        }

        self.core.idle.notify_waiters();

        if clear {
            self.core.history.clear();
            self.core.handlers.clear();
            registry().deregister(&self.core.id);
            debug!(bus = %self.core.name, "cleared history and deregistered");
        }
        debug!(bus = %self.core.name, "bus stopped");
    }

    /// Block until the queue is empty and nothing is pending or started.
    ///
    /// Re-verifies once after yielding so an event enqueued during the
    /// wait is caught instead of reporting a false idle.
    pub async fn wait_until_idle(&self, timeout: Option<Duration>) -> Result<(), BusError> {
        self.start()?;
        let started = tokio::time::Instant::now();
        loop {
            if self.is_quiescent() {
                tokio::task::yield_now().await;
                if self.is_quiescent() {
                    return Ok(());
                }
                continue;
            }
            let notified = self.core.idle.notified();
            if self.is_quiescent() {
                continue;
            }
            let slice = match timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        warn!(
                            bus = %self.core.name,
                            waited = ?limit,
                            processing = self.core.history.processing_count(),
                            "timeout waiting for bus to go idle"
                        );
                        return Err(BusError::Timeout { duration: limit });
                    }
                    (limit - elapsed).min(QUEUE_POLL_INTERVAL)
                }
                None => QUEUE_POLL_INTERVAL,
            };
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    pub(crate) fn is_quiescent(&self) -> bool {
        self.core.queue.is_empty() && self.core.history.processing_count() == 0
    }

    /// Register an abort handle for an in-flight handler task so shutdown
    /// can cancel stragglers.
    pub(crate) fn track_inflight(&self, handle: AbortHandle) {
        let mut inflight = self
            .core
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inflight.retain(|h| !h.is_finished());
        inflight.push(handle);
    }

    /// Wait for the next event matching a pattern, one-shot.
    ///
    /// ```ignore
    /// let reply = bus
    ///     .expect("ResponseEvent")
    ///     .include(move |e| e.payload_value()["request_id"] == request_id)
    ///     .timeout(Duration::from_secs(30))
    ///     .wait()
    ///     .await?;
    /// ```
    pub fn expect(&self, pattern: impl Into<Pattern>) -> Expectation {
        Expectation {
            bus: self.clone(),
            pattern: pattern.into(),
            include: None,
            exclude: None,
            timeout: None,
        }
    }

    /// Events retained in history that have not started processing.
    pub fn events_pending(&self) -> Vec<Event> {
        self.core.history.with_status(EventStatus::Pending)
    }

    /// Events retained in history that are currently processing.
    pub fn events_started(&self) -> Vec<Event> {
        self.core.history.with_status(EventStatus::Started)
    }

    /// Events retained in history that have completed.
    pub fn events_completed(&self) -> Vec<Event> {
        self.core.history.with_status(EventStatus::Completed)
    }

    #[cfg(test)]
    pub(crate) fn insert_history(&self, event: Event) {
        self.core.history.insert(event);
    }
}

impl fmt::Display for EventBus {
    /// `orders[queue=2 history=10 handlers=3]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[queue={} history={} handlers={}]",
            self.core.name,
            self.core.queue.len(),
            self.core.history.len(),
            self.handler_count()
        )
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.core.name)
            .field("running", &self.is_running())
            .field("queued", &self.core.queue.len())
            .field("history", &self.core.history.len())
            .finish_non_exhaustive()
    }
}

/// Builder for a configured [`EventBus`].
pub struct EventBusBuilder {
    name: String,
    config: BusConfig,
}

impl EventBusBuilder {
    /// Append completed events to this JSON Lines file.
    pub fn wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.wal_path = Some(path.into());
        self
    }

    /// Run one event's handlers concurrently.
    pub fn parallel_handlers(mut self, parallel: bool) -> Self {
        self.config.parallel_handlers = parallel;
        self
    }

    /// Bound on retained history.
    pub fn max_history_size(mut self, size: usize) -> Self {
        self.config.max_history_size = Some(size);
        self
    }

    /// Retain full history (no eviction).
    pub fn unbounded_history(mut self) -> Self {
        self.config.max_history_size = None;
        self
    }

    /// Backpressure ceiling on queued plus unsettled events.
    pub fn max_pending_events(mut self, limit: usize) -> Self {
        self.config.max_pending_events = limit;
        self
    }

    /// Causal self-recursion bound for non-forwarding handlers.
    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.config.recursion_limit = limit;
        self
    }

    /// Slow-handler watchdog delay.
    pub fn watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.config.watchdog_timeout = timeout;
        self
    }

    /// Timeout applied when neither handler nor event carries one.
    pub fn default_event_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_event_timeout = Some(timeout);
        self
    }

    /// Disable the fallback timeout entirely.
    pub fn no_default_event_timeout(mut self) -> Self {
        self.config.default_event_timeout = None;
        self
    }

    /// Build and register the bus.
    pub fn build(self) -> EventBus {
        if !is_identifier(&self.name) {
            warn!(
                name = %self.name,
                "bus name is not a valid identifier; event paths prefer identifier names"
            );
        }
        let config = self.config;
        let core = registry().register(&self.name, |name| {
            Arc::new(BusCore {
                id: Uuid::now_v7().to_string(),
                name,
                handlers: DashMap::new(),
                queue: EventQueue::new(config.max_pending_events),
                history: EventHistory::new(config.max_history_size),
                wal: config.wal_path.clone().map(WalWriter::new),
                config,
                running: AtomicBool::new(false),
                idle: Notify::new(),
                runloop: Mutex::new(None),
                inflight: Mutex::new(Vec::new()),
            })
        });
        EventBus { core }
    }
}

type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// One-shot expectation: resolves on the first matching event.
///
/// The temporary handler is deregistered unconditionally - on success,
/// timeout, or cancellation.
#[must_use = "an Expectation does nothing until wait() is awaited"]
pub struct Expectation {
    bus: EventBus,
    pattern: Pattern,
    include: Option<EventFilter>,
    exclude: Option<EventFilter>,
    timeout: Option<Duration>,
}

impl Expectation {
    /// Only resolve on events matching the predicate.
    pub fn include(mut self, f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.include = Some(Arc::new(f));
        self
    }

    /// Never resolve on events matching the predicate.
    pub fn exclude(mut self, f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.exclude = Some(Arc::new(f));
        self
    }

    /// Give up after this long.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait for the first matching event.
    pub async fn wait(self) -> Result<Event, BusError> {
        let (tx, rx) = tokio::sync::oneshot::channel::<Event>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let include = self.include;
        let exclude = self.exclude;

        let uid_tail = Uuid::now_v7().simple().to_string();
        let name = format!(
            "expect_{}_{}",
            self.pattern.key().replace('*', "any"),
            &uid_tail[uid_tail.len() - 8..]
        );
        let slot_for_handler = slot.clone();
        let handler = Handler::sync(name, move |event: Event| {
            let included = include.as_ref().map(|f| f(&event)).unwrap_or(true);
            let excluded = exclude.as_ref().map(|f| f(&event)).unwrap_or(false);
            if included && !excluded {
                let mut slot = slot_for_handler
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(tx) = slot.take() {
                    let _ = tx.send(event);
                }
            }
            Ok(HandlerOutput::None)
        });

        // Deregistration must happen on every exit path, cancellation
        // included, so it rides a drop guard.
        let _cleanup = ExpectGuard {
            bus: self.bus.clone(),
            pattern_key: self.pattern.key().to_string(),
            handler_uid: handler.uid.clone(),
        };
        self.bus.on(self.pattern.clone(), handler);

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Err(_) => Err(BusError::Timeout { duration: limit }),
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => Err(BusError::QueueShutdown),
            },
            None => rx.await.map_err(|_| BusError::QueueShutdown),
        }
    }
}

struct ExpectGuard {
    bus: EventBus,
    pattern_key: String,
    handler_uid: String,
}

impl Drop for ExpectGuard {
    fn drop(&mut self) {
        self.bus.off(&self.pattern_key, &self.handler_uid);
    }
}
