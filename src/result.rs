//! Per-(event, handler) execution records and the result accessor family.
//!
//! Every applicable handler gets exactly one [`EventResult`] per event. The
//! status machine is monotonic: `Pending → Started → {Completed, Error}`,
//! and a terminal status never regresses. `completed_at` is stamped exactly
//! once, atomically with waking anyone blocked on the result.
//!
//! # Result access
//!
//! [`Event::results`](crate::Event::results) returns a [`ResultsQuery`]:
//! filters plus flags controlling whether the absence of a match or the
//! presence of a handler error raises.
//!
//! ```ignore
//! // First meaningful value, re-raising the first handler error if any:
//! let value = bus.dispatch(event)?.results().first_value().await?;
//!
//! // Everything, errors tolerated:
//! let all = event
//!     .results()
//!     .raise_if_any_error(false)
//!     .raise_if_none(false)
//!     .all()
//!     .await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

use crate::error::{BusError, ResultError};
use crate::event::{Event, EventId, ValueKind};
use crate::handler::HandlerOutput;

/// Status of a single handler execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Result created, handler not started.
    Pending,
    /// Handler is executing.
    Started,
    /// Handler returned successfully.
    Completed,
    /// Handler failed, timed out, or was cancelled.
    Error,
}

impl ResultStatus {
    /// True for `Completed` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResultStatus::Completed | ResultStatus::Error)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Pending => write!(f, "pending"),
            ResultStatus::Started => write!(f, "started"),
            ResultStatus::Completed => write!(f, "completed"),
            ResultStatus::Error => write!(f, "error"),
        }
    }
}

/// What a handler produced.
#[derive(Debug, Clone)]
pub enum ResultValue {
    /// An ordinary JSON return value.
    Json(Value),
    /// A forwarded event (the handler's action was dispatching onto another
    /// bus). Excluded from value accessors and from kind validation.
    Event(Event),
}

impl ResultValue {
    /// The JSON value, if this is one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResultValue::Json(value) => Some(value),
            ResultValue::Event(_) => None,
        }
    }

    /// The forwarded event, if this is one.
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            ResultValue::Json(_) => None,
            ResultValue::Event(event) => Some(event),
        }
    }
}

struct ResultInner {
    id: String,
    event_id: EventId,
    handler_id: String,
    handler_name: String,
    bus_id: String,
    bus_name: String,
    timeout: Option<Duration>,
    result_kind: Option<ValueKind>,
    state: Mutex<ResultState>,
    done: AtomicBool,
    done_notify: Notify,
}

#[derive(Default)]
struct ResultState {
    status: Option<ResultStatus>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    value: Option<ResultValue>,
    error: Option<ResultError>,
    children: Vec<Event>,
}

/// Execution record for one handler on one event.
#[derive(Clone)]
pub struct EventResult {
    inner: Arc<ResultInner>,
}

impl EventResult {
    pub(crate) fn new(
        event: &Event,
        handler_id: impl Into<String>,
        handler_name: impl Into<String>,
        bus_id: impl Into<String>,
        bus_name: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ResultInner {
                id: Uuid::now_v7().to_string(),
                event_id: event.id().to_string(),
                handler_id: handler_id.into(),
                handler_name: handler_name.into(),
                bus_id: bus_id.into(),
                bus_name: bus_name.into(),
                timeout,
                result_kind: event.result_kind(),
                state: Mutex::new(ResultState::default()),
                done: AtomicBool::new(false),
                done_notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ResultState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Unique id of this result record.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Id of the event this result belongs to.
    pub fn event_id(&self) -> &str {
        &self.inner.event_id
    }

    /// Stable handler identity (`"{bus id}.{handler registration id}"`).
    pub fn handler_id(&self) -> &str {
        &self.inner.handler_id
    }

    /// Display name of the handler.
    pub fn handler_name(&self) -> &str {
        &self.inner.handler_name
    }

    /// Name of the bus that executed the handler.
    pub fn bus_name(&self) -> &str {
        &self.inner.bus_name
    }

    /// Id of the bus that executed the handler.
    pub fn bus_id(&self) -> &str {
        &self.inner.bus_id
    }

    /// The effective timeout this handler ran under.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Current status.
    pub fn status(&self) -> ResultStatus {
        self.state().status.unwrap_or(ResultStatus::Pending)
    }

    /// True once the status is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// When the handler started executing.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    /// When the handler settled.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state().completed_at
    }

    /// The recorded value, if the handler completed with one.
    pub fn value(&self) -> Option<ResultValue> {
        self.state().value.clone()
    }

    /// The recorded JSON value, if any.
    pub fn json_value(&self) -> Option<Value> {
        self.state().value.as_ref().and_then(|v| v.as_json().cloned())
    }

    /// The recorded error, if any.
    pub fn error(&self) -> Option<ResultError> {
        self.state().error.clone()
    }

    /// Events dispatched from inside this handler's execution.
    pub fn children(&self) -> Vec<Event> {
        self.state().children.clone()
    }

    pub(crate) fn add_child(&self, event: Event) {
        self.state().children.push(event);
    }

    /// Transition to `Started`. A no-op on terminal results.
    pub(crate) fn mark_started(&self) {
        let mut state = self.state();
        if state.status.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        state.status = Some(ResultStatus::Started);
        state.started_at.get_or_insert_with(Utc::now);
    }

    /// Record a successful handler outcome, validating JSON values against
    /// the event's declared result kind. Forwarded events skip validation.
    pub(crate) fn record_output(&self, output: HandlerOutput) {
        {
            let mut state = self.state();
            if state.status.map(|s| s.is_terminal()).unwrap_or(false) {
                return;
            }
            match output {
                HandlerOutput::Event(event) => {
                    state.value = Some(ResultValue::Event(event));
                    state.status = Some(ResultStatus::Completed);
                }
                HandlerOutput::None => {
                    state.status = Some(ResultStatus::Completed);
                }
                HandlerOutput::Value(value) => match self.inner.result_kind {
                    Some(expected) if ValueKind::of(&value) != expected && !value.is_null() => {
                        state.error = Some(ResultError::validation(format!(
                            "handler returned a {} value, expected {}",
                            ValueKind::of(&value),
                            expected
                        )));
                        state.status = Some(ResultStatus::Error);
                    }
                    _ => {
                        state.value = Some(ResultValue::Json(value));
                        state.status = Some(ResultStatus::Completed);
                    }
                },
            }
            Self::finalize(&mut state);
        }
        self.settle();
    }

    /// Record a failure. A no-op on already-terminal results (a timeout
    /// racing a late success must not overwrite it, and vice versa).
    pub(crate) fn record_error(&self, error: ResultError) {
        {
            let mut state = self.state();
            if state.status.map(|s| s.is_terminal()).unwrap_or(false) {
                return;
            }
            state.error = Some(error);
            state.status = Some(ResultStatus::Error);
            Self::finalize(&mut state);
        }
        self.settle();
    }

    fn finalize(state: &mut ResultState) {
        state.started_at.get_or_insert_with(Utc::now);
        state.completed_at.get_or_insert_with(Utc::now);
    }

    fn settle(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.done_notify.notify_waiters();
    }

    /// Recursively cancel still-pending results among this handler's child
    /// events, causally linking the cancellation to `cause`.
    pub(crate) fn cancel_pending_children(&self, cause: &str) {
        let mut visited = std::collections::HashSet::new();
        self.cancel_children_inner(cause, &mut visited);
    }

    fn cancel_children_inner(
        &self,
        cause: &str,
        visited: &mut std::collections::HashSet<String>,
    ) {
        for child in self.children() {
            if !visited.insert(child.id().to_string()) {
                continue;
            }
            for result in child.event_results() {
                if result.status() == ResultStatus::Pending {
                    result.record_error(ResultError::cancelled(format!(
                        "cancelled pending handler {} because of parent error: {}",
                        result.handler_name(),
                        cause
                    )));
                }
                result.cancel_children_inner(cause, visited);
            }
        }
    }

    /// Wait for this result to settle, then return the value or surface the
    /// recorded error. Waits at most the handler's effective timeout.
    pub async fn wait(&self) -> Result<Option<ResultValue>, BusError> {
        let settled = async {
            loop {
                let notified = self.inner.done_notify.notified();
                if self.inner.done.load(Ordering::Acquire) {
                    return;
                }
                notified.await;
            }
        };
        match self.inner.timeout {
            Some(timeout) => tokio::time::timeout(timeout, settled)
                .await
                .map_err(|_| BusError::HandlerTimeout {
                    handler: self.handler_name().to_string(),
                    timeout,
                })?,
            None => settled.await,
        }
        match self.error() {
            Some(error) => Err(self.error_to_bus_error(&error)),
            None => Ok(self.value()),
        }
    }

    fn error_to_bus_error(&self, error: &ResultError) -> BusError {
        if error.is_timeout() {
            BusError::HandlerTimeout {
                handler: self.handler_name().to_string(),
                timeout: self.inner.timeout.unwrap_or(Duration::ZERO),
            }
        } else {
            BusError::HandlerError {
                handler: self.handler_name().to_string(),
                message: error.message.clone(),
            }
        }
    }

    /// Serializable snapshot for WAL records.
    pub fn to_record(&self) -> ResultRecord {
        let state = self.state();
        ResultRecord {
            id: self.inner.id.clone(),
            event_id: self.inner.event_id.clone(),
            handler_id: self.inner.handler_id.clone(),
            handler_name: self.inner.handler_name.clone(),
            bus_name: self.inner.bus_name.clone(),
            status: state.status.unwrap_or(ResultStatus::Pending),
            timeout: self.inner.timeout.map(|d| d.as_secs_f64()),
            started_at: state.started_at,
            completed_at: state.completed_at,
            result: state.value.as_ref().and_then(|v| v.as_json().cloned()),
            forwarded_to: state
                .value
                .as_ref()
                .and_then(|v| v.as_event())
                .map(|e| e.id().to_string()),
            error: state.error.clone(),
            child_event_ids: state.children.iter().map(|c| c.id().to_string()).collect(),
        }
    }
}

impl fmt::Display for EventResult {
    /// `orders.reserve_stock() (completed)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}() ({})",
            self.bus_name(),
            self.handler_name(),
            self.status()
        )
    }
}

impl fmt::Debug for EventResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventResult")
            .field("handler", &self.handler_name())
            .field("status", &self.status())
            .field("error", &self.error())
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of one result, embedded in WAL lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub event_id: EventId,
    pub handler_id: String,
    pub handler_name: String,
    pub bus_name: String,
    pub status: ResultStatus,
    /// Seconds, for stable JSON representation.
    pub timeout: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    /// Id of the forwarded event when the handler's action was forwarding.
    pub forwarded_to: Option<EventId>,
    pub error: Option<ResultError>,
    pub child_event_ids: Vec<EventId>,
}

/// The default include filter: completed, error-free, non-null JSON values.
/// Forwarded events are routing artifacts, not return values.
fn is_meaningful(result: &EventResult) -> bool {
    if result.status() != ResultStatus::Completed || result.error().is_some() {
        return false;
    }
    match result.value() {
        Some(ResultValue::Json(value)) => !value.is_null(),
        _ => false,
    }
}

type ResultFilter = Arc<dyn Fn(&EventResult) -> bool + Send + Sync>;

/// Builder-style accessor over an event's settled results.
#[must_use = "a ResultsQuery does nothing until a finisher is awaited"]
pub struct ResultsQuery {
    event: Event,
    include: Option<ResultFilter>,
    exclude: Option<ResultFilter>,
    raise_if_any_error: bool,
    raise_if_none: bool,
    allow_conflicts: bool,
    timeout: Option<Duration>,
}

impl Event {
    /// Access this event's results once processing settles.
    pub fn results(&self) -> ResultsQuery {
        ResultsQuery {
            event: self.clone(),
            include: None,
            exclude: None,
            raise_if_any_error: true,
            raise_if_none: true,
            allow_conflicts: false,
            timeout: None,
        }
    }
}

impl ResultsQuery {
    /// Keep only results matching the predicate (replaces the default
    /// meaningful-value filter).
    pub fn include(mut self, f: impl Fn(&EventResult) -> bool + Send + Sync + 'static) -> Self {
        self.include = Some(Arc::new(f));
        self
    }

    /// Drop results matching the predicate.
    pub fn exclude(mut self, f: impl Fn(&EventResult) -> bool + Send + Sync + 'static) -> Self {
        self.exclude = Some(Arc::new(f));
        self
    }

    /// Whether the first handler error is re-raised (default true).
    pub fn raise_if_any_error(mut self, raise: bool) -> Self {
        self.raise_if_any_error = raise;
        self
    }

    /// Whether an empty match set raises `NoResults` (default true).
    pub fn raise_if_none(mut self, raise: bool) -> Self {
        self.raise_if_none = raise;
        self
    }

    /// Allow key conflicts in `flat_object`, last handler wins.
    pub fn allow_conflicts(mut self) -> Self {
        self.allow_conflicts = true;
        self
    }

    /// Deadline for the event to settle. Defaults to the event timeout,
    /// falling back to the bus-default constant.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn settled(&self) -> Result<Vec<EventResult>, BusError> {
        let deadline = self
            .timeout
            .or_else(|| self.event.timeout())
            .unwrap_or(crate::bus::DEFAULT_EVENT_TIMEOUT);
        self.event.wait_timeout(deadline).await?;
        Ok(self.event.event_results())
    }

    fn filter(&self, results: &[EventResult]) -> Result<Vec<EventResult>, BusError> {
        if self.raise_if_any_error {
            if let Some(failed) = results.iter().find(|r| r.error().is_some()) {
                let error = failed.error().unwrap_or_else(|| {
                    ResultError::handler("unknown handler error")
                });
                return Err(failed.error_to_bus_error(&error));
            }
        }
        let included: Vec<EventResult> = results
            .iter()
            .filter(|r| match &self.include {
                Some(f) => f(r),
                None => is_meaningful(r),
            })
            .filter(|r| match &self.exclude {
                Some(f) => !f(r),
                None => true,
            })
            .cloned()
            .collect();
        if self.raise_if_none && included.is_empty() {
            return Err(BusError::NoResults {
                event: self.event.to_string(),
            });
        }
        Ok(included)
    }

    /// All matching results.
    pub async fn all(self) -> Result<Vec<EventResult>, BusError> {
        let results = self.settled().await?;
        self.filter(&results)
    }

    /// The first matching result's JSON value.
    pub async fn first_value(self) -> Result<Value, BusError> {
        let results = self.settled().await?;
        let included = self.filter(&results)?;
        Ok(included
            .first()
            .and_then(|r| r.json_value())
            .unwrap_or(Value::Null))
    }

    /// All matching results' JSON values, in creation order.
    pub async fn values(self) -> Result<Vec<Value>, BusError> {
        let results = self.settled().await?;
        let included = self.filter(&results)?;
        Ok(included
            .iter()
            .map(|r| r.json_value().unwrap_or(Value::Null))
            .collect())
    }

    /// Matching results' values keyed by handler display name.
    ///
    /// Handlers registered with duplicate names overwrite each other here;
    /// registration logs a warning for that case.
    pub async fn by_handler_name(self) -> Result<BTreeMap<String, Value>, BusError> {
        let results = self.settled().await?;
        let included = self.filter(&results)?;
        Ok(included
            .iter()
            .map(|r| {
                (
                    r.handler_name().to_string(),
                    r.json_value().unwrap_or(Value::Null),
                )
            })
            .collect())
    }

    /// Merge object-valued results into one flat JSON object.
    ///
    /// Conflicting keys are an error unless `allow_conflicts` was set, in
    /// which case the last handler wins.
    pub async fn flat_object(self) -> Result<serde_json::Map<String, Value>, BusError> {
        let results = self.settled().await?;
        let included = self.filter(&results)?;
        let mut merged = serde_json::Map::new();
        for result in included {
            let Some(Value::Object(object)) = result.json_value() else {
                continue;
            };
            for (key, value) in object {
                if merged.contains_key(&key) && !self.allow_conflicts {
                    return Err(BusError::Validation {
                        message: format!(
                            "handler {} returned key {:?} that would overwrite an earlier \
                             handler's value (use allow_conflicts for last-wins merging)",
                            result.handler_name(),
                            key
                        ),
                    });
                }
                merged.insert(key, value);
            }
        }
        Ok(merged)
    }

    /// Concatenate array-valued results into one flat list.
    pub async fn flat_array(self) -> Result<Vec<Value>, BusError> {
        let results = self.settled().await?;
        let included = self.filter(&results)?;
        let mut merged = Vec::new();
        for result in included {
            if let Some(Value::Array(items)) = result.json_value() {
                merged.extend(items);
            } else {
                warn!(
                    handler = result.handler_name(),
                    "flat_array skipping non-array result"
                );
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result_for(event: &Event, name: &str) -> EventResult {
        let result = EventResult::new(event, format!("bus.{name}"), name, "bus", "main", None);
        event.add_result(result.clone());
        result
    }

    #[test]
    fn test_status_machine_monotonic() {
        let event = Event::new("E").build();
        let result = result_for(&event, "h");
        assert_eq!(result.status(), ResultStatus::Pending);

        result.mark_started();
        assert_eq!(result.status(), ResultStatus::Started);
        assert!(result.started_at().is_some());

        result.record_output(HandlerOutput::Value(json!(1)));
        assert_eq!(result.status(), ResultStatus::Completed);
        let completed_at = result.completed_at().unwrap();

        // Terminal status never regresses, completed_at is set once.
        result.record_error(ResultError::handler("late failure"));
        assert_eq!(result.status(), ResultStatus::Completed);
        assert_eq!(result.completed_at().unwrap(), completed_at);
        assert!(result.error().is_none());
    }

    #[test]
    fn test_error_does_not_regress_to_success() {
        let event = Event::new("E").build();
        let result = result_for(&event, "h");
        result.record_error(ResultError::timeout("too slow"));
        result.record_output(HandlerOutput::Value(json!("late")));
        assert_eq!(result.status(), ResultStatus::Error);
        assert!(result.value().is_none());
    }

    #[test]
    fn test_result_kind_validation() {
        let event = Event::new("E").result_kind(ValueKind::String).build();
        let result = result_for(&event, "h");
        result.record_output(HandlerOutput::Value(json!(42)));
        assert_eq!(result.status(), ResultStatus::Error);
        let error = result.error().unwrap();
        assert_eq!(error.kind, crate::ErrorKind::Validation);
        assert!(error.message.contains("number"));
        assert!(error.message.contains("string"));
    }

    #[test]
    fn test_forwarded_event_skips_validation() {
        let event = Event::new("E").result_kind(ValueKind::String).build();
        let result = result_for(&event, "forward");
        let forwarded = Event::new("E2").build();
        result.record_output(HandlerOutput::Event(forwarded.clone()));
        assert_eq!(result.status(), ResultStatus::Completed);
        assert_eq!(
            result.value().unwrap().as_event().unwrap().id(),
            forwarded.id()
        );
    }

    #[tokio::test]
    async fn test_wait_returns_value() {
        let event = Event::new("E").build();
        let result = result_for(&event, "h");
        let waiter = result.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        result.record_output(HandlerOutput::Value(json!("done")));
        let value = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(value.as_json().unwrap(), &json!("done"));
    }

    #[tokio::test]
    async fn test_wait_surfaces_timeout_flavor() {
        let event = Event::new("E").build();
        let result = result_for(&event, "slow");
        result.record_error(ResultError::timeout("slow handler"));
        let err = result.wait().await.unwrap_err();
        assert!(matches!(err, BusError::HandlerTimeout { .. }));
    }

    #[test]
    fn test_cancel_pending_children_is_causal_and_recursive() {
        let event = Event::new("Root").build();
        let root_result = result_for(&event, "root_handler");

        let child = Event::new("Child").build();
        let child_result = result_for(&child, "child_handler");
        root_result.add_child(child.clone());

        let grandchild = Event::new("Grandchild").build();
        let grandchild_result = result_for(&grandchild, "grandchild_handler");
        child_result.add_child(grandchild.clone());

        // A started result is not "pending" and must survive.
        let started = result_for(&child, "already_running");
        started.mark_started();

        root_result.cancel_pending_children("root_handler timed out after 0.1s");

        let cancelled = child_result.error().unwrap();
        assert_eq!(cancelled.kind, crate::ErrorKind::Cancelled);
        assert!(cancelled.message.contains("root_handler timed out"));
        assert_eq!(grandchild_result.status(), ResultStatus::Error);
        assert_eq!(started.status(), ResultStatus::Started);
    }

    #[tokio::test]
    async fn test_results_query_first_value_and_error_raise() {
        let event = Event::new("E").build();
        let ok = result_for(&event, "ok");
        ok.record_output(HandlerOutput::Value(json!("fine")));
        event.mark_complete_if_settled();

        let value = event.results().first_value().await.unwrap();
        assert_eq!(value, json!("fine"));

        let failing_event = Event::new("F").build();
        let bad = result_for(&failing_event, "bad");
        bad.record_error(ResultError::handler("boom"));
        failing_event.mark_complete_if_settled();

        let err = failing_event.results().first_value().await.unwrap_err();
        assert!(matches!(err, BusError::HandlerError { .. }));

        // Tolerant query still yields nothing useful but no error raise.
        let err = failing_event
            .results()
            .raise_if_any_error(false)
            .first_value()
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResults { .. }));
    }

    #[tokio::test]
    async fn test_results_query_filters() {
        let event = Event::new("E").build();
        let one = result_for(&event, "one");
        one.record_output(HandlerOutput::Value(json!(1)));
        let two = result_for(&event, "two");
        two.record_output(HandlerOutput::Value(json!(2)));
        event.mark_complete_if_settled();

        let values = event
            .results()
            .exclude(|r| r.handler_name() == "one")
            .values()
            .await
            .unwrap();
        assert_eq!(values, vec![json!(2)]);

        let by_name = event.results().by_handler_name().await.unwrap();
        assert_eq!(by_name["one"], json!(1));
        assert_eq!(by_name["two"], json!(2));
    }

    #[tokio::test]
    async fn test_flat_object_conflict_detection() {
        let event = Event::new("E").build();
        let one = result_for(&event, "one");
        one.record_output(HandlerOutput::Value(json!({ "a": 1 })));
        let two = result_for(&event, "two");
        two.record_output(HandlerOutput::Value(json!({ "a": 2, "b": 3 })));
        event.mark_complete_if_settled();

        let err = event.results().flat_object().await.unwrap_err();
        assert!(matches!(err, BusError::Validation { .. }));

        let merged = event
            .results()
            .allow_conflicts()
            .flat_object()
            .await
            .unwrap();
        assert_eq!(merged["a"], json!(2));
        assert_eq!(merged["b"], json!(3));
    }

    #[tokio::test]
    async fn test_flat_array_concatenates() {
        let event = Event::new("E").build();
        let one = result_for(&event, "one");
        one.record_output(HandlerOutput::Value(json!([1, 2])));
        let two = result_for(&event, "two");
        two.record_output(HandlerOutput::Value(json!([3])));
        event.mark_complete_if_settled();

        let merged = event.results().flat_array().await.unwrap();
        assert_eq!(merged, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_record_snapshot() {
        let event = Event::new("E").build();
        let result = result_for(&event, "h");
        result.mark_started();
        result.record_output(HandlerOutput::Value(json!({ "n": 1 })));

        let record = result.to_record();
        assert_eq!(record.status, ResultStatus::Completed);
        assert_eq!(record.result, Some(json!({ "n": 1 })));
        assert!(record.forwarded_to.is_none());
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());

        let json = serde_json::to_string(&record).unwrap();
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.handler_name, "h");
        assert_eq!(back.status, ResultStatus::Completed);
    }
}
