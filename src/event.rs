//! The event envelope: identity, payload, routing path, per-handler results,
//! and a completion signal that any number of awaiters can block on.
//!
//! `Event` is a cheap-clone handle over shared state. The same handle lives
//! in the bus queue, in bus history, and in the hands of whoever dispatched
//! it; history eviction drops only the history reference, never the event.
//!
//! # Status derivation
//!
//! An event's status is never stored, always derived:
//! - `Completed` - every handler result is terminal *and* every child event
//!   (recursively) has settled
//! - `Started` - at least one handler result has started
//! - `Pending` - otherwise
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{Event, ValueKind};
//!
//! let event = Event::new("OrderPlaced")
//!     .payload(&serde_json::json!({ "order_id": 7 }))?
//!     .result_kind(ValueKind::String)
//!     .build();
//!
//! let completed = bus.dispatch(event)?.wait().await?;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::context;
use crate::engine;
use crate::error::BusError;
use crate::result::{EventResult, ResultRecord};

/// String form of a UUIDv7 event identity.
pub type EventId = String;

/// Derived lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Dispatched but no handler has started yet.
    Pending,
    /// At least one handler has started.
    Started,
    /// Every handler result is terminal and every descendant event settled.
    Completed,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Pending => write!(f, "pending"),
            EventStatus::Started => write!(f, "started"),
            EventStatus::Completed => write!(f, "completed"),
        }
    }
}

/// JSON value shape a handler result is expected to have.
///
/// The Rust rendition of a declared result type: handler return values are
/// JSON, so the contract is a value-kind check. Forwarded events skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// The kind of a concrete JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Null => write!(f, "null"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Number => write!(f, "number"),
            ValueKind::String => write!(f, "string"),
            ValueKind::Array => write!(f, "array"),
            ValueKind::Object => write!(f, "object"),
        }
    }
}

/// A typed event payload with a stable event type identifier.
///
/// Implementing this trait lets a plain struct act as the event definition:
/// `Event::of(&payload)` builds the envelope, `event.payload::<T>()` gets it
/// back out, and `Pattern::of::<T>()` subscribes to it.
///
/// # Example
///
/// ```ignore
/// use conveyor::{EventPayload, ValueKind};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl EventPayload for OrderPlaced {
///     fn event_type() -> &'static str {
///         "OrderPlaced"
///     }
/// }
/// ```
pub trait EventPayload: Serialize {
    /// Stable event type identifier. Must be a valid identifier string.
    fn event_type() -> &'static str;

    /// Expected shape of handler return values, if any.
    fn result_kind() -> Option<ValueKind> {
        None
    }
}

struct EventInner {
    id: EventId,
    event_type: String,
    schema: String,
    timeout: Option<Duration>,
    created_at: DateTime<Utc>,
    payload: Value,
    result_kind: Option<ValueKind>,
    state: Mutex<EventState>,
    complete: AtomicBool,
    complete_notify: Notify,
}

#[derive(Default)]
struct EventState {
    parent_id: Option<EventId>,
    path: SmallVec<[String; 4]>,
    processed_at: Option<DateTime<Utc>>,
    results: Vec<EventResult>,
}

/// An event flowing through one or more buses.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Start building an event of the given type.
    pub fn new(event_type: impl Into<String>) -> EventBuilder {
        EventBuilder {
            event_type: event_type.into(),
            schema: None,
            timeout: None,
            payload: Value::Null,
            result_kind: None,
            parent_id: None,
        }
    }

    /// Build an event directly from a typed payload.
    pub fn of<P: EventPayload>(payload: &P) -> Result<Event, BusError> {
        let mut builder = Event::new(P::event_type()).payload(payload)?;
        if let Some(kind) = P::result_kind() {
            builder = builder.result_kind(kind);
        }
        Ok(builder.build())
    }

    fn state(&self) -> MutexGuard<'_, EventState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The event's unique id (UUIDv7, time-ordered).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The event type identifier.
    pub fn event_type(&self) -> &str {
        &self.inner.event_type
    }

    /// Schema tag, `"{event_type}@{crate version}"` unless overridden.
    pub fn schema(&self) -> &str {
        &self.inner.schema
    }

    /// Event-level timeout. `None` defers to the bus default.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// When the event was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Expected handler result shape, if declared.
    pub fn result_kind(&self) -> Option<ValueKind> {
        self.inner.result_kind
    }

    /// The raw JSON payload.
    pub fn payload_value(&self) -> Value {
        self.inner.payload.clone()
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.inner.payload.clone())?)
    }

    /// Id of the event whose handler dispatched this one, if any.
    pub fn parent_id(&self) -> Option<EventId> {
        self.state().parent_id.clone()
    }

    /// Names of the buses this event has been dispatched onto, in order.
    pub fn path(&self) -> Vec<String> {
        self.state().path.iter().cloned().collect()
    }

    /// When the event finished processing, if it has.
    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.state().processed_at
    }

    /// Snapshot of all per-handler results in creation order.
    pub fn event_results(&self) -> Vec<EventResult> {
        self.state().results.clone()
    }

    /// The result recorded for a specific handler id, if any.
    pub(crate) fn result_for(&self, handler_id: &str) -> Option<EventResult> {
        self.state()
            .results
            .iter()
            .find(|r| r.handler_id() == handler_id)
            .cloned()
    }

    /// All child events dispatched from within this event's handlers.
    pub fn children(&self) -> Vec<Event> {
        let results = self.event_results();
        results.iter().flat_map(|r| r.children()).collect()
    }

    /// When the first handler started, if any did.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        let results = self.event_results();
        let started = results.iter().filter_map(|r| r.started_at()).min();
        // A handled-by-nobody event counts as started once it was processed.
        started.or_else(|| if results.is_empty() { self.processed_at() } else { None })
    }

    /// When the last handler settled, if all of them have.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        let results = self.event_results();
        if results.is_empty() {
            return self.processed_at();
        }
        if !results.iter().all(|r| r.is_terminal()) {
            return None;
        }
        results
            .iter()
            .filter_map(|r| r.completed_at())
            .max()
            .or_else(|| self.processed_at())
    }

    /// Derived lifecycle status.
    pub fn status(&self) -> EventStatus {
        if self.is_complete() {
            return EventStatus::Completed;
        }
        let mut visited = HashSet::new();
        if self.is_settled() && self.children_complete(&mut visited) {
            return EventStatus::Completed;
        }
        let results = self.event_results();
        if results.iter().any(|r| r.started_at().is_some()) {
            EventStatus::Started
        } else {
            EventStatus::Pending
        }
    }

    /// True once the completion signal has fired.
    pub fn is_complete(&self) -> bool {
        self.inner.complete.load(Ordering::Acquire)
    }

    /// Handlers-only completion: every recorded result is terminal (or the
    /// event was processed with no handlers). Does not consider children.
    pub(crate) fn is_settled(&self) -> bool {
        let state = self.state();
        if state.results.is_empty() {
            return state.processed_at.is_some();
        }
        state.results.iter().all(|r| r.is_terminal())
    }

    /// Recursively check that all descendant events have settled.
    ///
    /// Guarded by a visited set so malformed (cyclic) parent links cannot
    /// recurse forever.
    pub(crate) fn children_complete(&self, visited: &mut HashSet<EventId>) -> bool {
        for child in self.children() {
            if !visited.insert(child.id().to_string()) {
                continue;
            }
            if !child.is_settled() {
                return false;
            }
            if !child.children_complete(visited) {
                return false;
            }
        }
        true
    }

    /// Fire the completion signal if every handler result is terminal and
    /// every descendant has settled. Returns true on the transition.
    pub(crate) fn mark_complete_if_settled(&self) -> bool {
        if self.is_complete() {
            return false;
        }
        {
            let mut state = self.state();
            if state.results.is_empty() {
                // Processed with no applicable handlers: complete as-is.
                state.processed_at.get_or_insert_with(Utc::now);
            } else {
                if !state.results.iter().all(|r| r.is_terminal()) {
                    return false;
                }
                drop(state);
                let mut visited = HashSet::new();
                if !self.children_complete(&mut visited) {
                    return false;
                }
                let mut state = self.state();
                state.processed_at.get_or_insert_with(Utc::now);
            }
        }
        self.inner.complete.store(true, Ordering::Release);
        self.inner.complete_notify.notify_waiters();
        true
    }

    pub(crate) fn set_parent(&self, parent_id: EventId) {
        self.state().parent_id = Some(parent_id);
    }

    /// Append a bus name to the routing path. Returns false when the name
    /// was already present (the forwarding-loop signal).
    pub(crate) fn push_path(&self, bus_name: &str) -> bool {
        let mut state = self.state();
        if state.path.iter().any(|name| name == bus_name) {
            return false;
        }
        state.path.push(bus_name.to_string());
        true
    }

    pub(crate) fn add_result(&self, result: EventResult) {
        self.state().results.push(result);
    }

    pub(crate) fn stamp_processed(&self) {
        self.state().processed_at.get_or_insert_with(Utc::now);
    }

    /// Block until the completion signal fires.
    ///
    /// When called from inside a handler whose chain holds the global lock,
    /// waiting on the signal would deadlock (the run loop that must make
    /// progress is the one we are running on). Instead, ready work from all
    /// live buses is serviced cooperatively until this event completes.
    pub async fn wait(&self) -> Result<Event, BusError> {
        if !self.is_complete() && context::inside_handler() && context::holds_global_lock() {
            engine::drain_until_complete(self).await;
            return Ok(self.clone());
        }
        loop {
            // Register before checking so a completion between the check
            // and the await cannot be missed.
            let notified = self.inner.complete_notify.notified();
            if self.is_complete() {
                return Ok(self.clone());
            }
            notified.await;
        }
    }

    /// Block until completion or the deadline, whichever comes first.
    pub async fn wait_timeout(&self, duration: Duration) -> Result<Event, BusError> {
        tokio::time::timeout(duration, self.wait())
            .await
            .map_err(|_| BusError::Timeout { duration })?
    }

    /// Serializable snapshot of the full event, nested results included.
    pub fn to_record(&self) -> EventRecord {
        let state = self.state();
        let results: Vec<ResultRecord> = state.results.iter().map(|r| r.to_record()).collect();
        let record = EventRecord {
            event_id: self.inner.id.clone(),
            event_type: self.inner.event_type.clone(),
            event_schema: self.inner.schema.clone(),
            event_timeout: self.inner.timeout.map(|d| d.as_secs_f64()),
            event_created_at: self.inner.created_at,
            event_processed_at: state.processed_at,
            event_parent_id: state.parent_id.clone(),
            event_path: state.path.iter().cloned().collect(),
            payload: self.inner.payload.clone(),
            event_results: results,
        };
        drop(state);
        record
    }
}

impl fmt::Display for Event {
    /// `OrderPlaced#4f21(started)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id();
        let tail = &id[id.len().saturating_sub(4)..];
        write!(f, "{}#{}({})", self.event_type(), tail, self.status())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id())
            .field("event_type", &self.event_type())
            .field("status", &self.status())
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Event`].
pub struct EventBuilder {
    event_type: String,
    schema: Option<String>,
    timeout: Option<Duration>,
    payload: Value,
    result_kind: Option<ValueKind>,
    parent_id: Option<EventId>,
}

impl EventBuilder {
    /// Attach a serializable payload.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, BusError> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Attach a raw JSON payload.
    pub fn payload_value(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Event-level processing timeout. Unset defers to the bus default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declare the expected shape of handler return values.
    pub fn result_kind(mut self, kind: ValueKind) -> Self {
        self.result_kind = Some(kind);
        self
    }

    /// Explicit causal parent. Normally set automatically when dispatching
    /// from inside a handler.
    pub fn parent(mut self, parent_id: impl Into<EventId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Override the schema tag.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Build the event.
    pub fn build(self) -> Event {
        let schema = self
            .schema
            .unwrap_or_else(|| format!("{}@{}", self.event_type, env!("CARGO_PKG_VERSION")));
        Event {
            inner: Arc::new(EventInner {
                id: Uuid::now_v7().to_string(),
                event_type: self.event_type,
                schema,
                timeout: self.timeout,
                created_at: Utc::now(),
                payload: self.payload,
                result_kind: self.result_kind,
                state: Mutex::new(EventState {
                    parent_id: self.parent_id,
                    ..EventState::default()
                }),
                complete: AtomicBool::new(false),
                complete_notify: Notify::new(),
            }),
        }
    }
}

/// One WAL line: the full event with nested results at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub event_type: String,
    pub event_schema: String,
    /// Seconds, for stable JSON representation.
    pub event_timeout: Option<f64>,
    pub event_created_at: DateTime<Utc>,
    pub event_processed_at: Option<DateTime<Utc>>,
    pub event_parent_id: Option<EventId>,
    pub event_path: Vec<String>,
    pub payload: Value,
    pub event_results: Vec<ResultRecord>,
}

/// True for strings usable as event types and bus names: an ASCII
/// identifier that does not start with a digit or underscore-only noise.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
