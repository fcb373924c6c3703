//! Handler registration: every supported call shape is normalized at
//! registration time into one uniform `(event) -> outcome` form plus an
//! explicit kind flag, so the hot path never sniffs shapes.
//!
//! Supported shapes:
//! - async closures/functions - [`Handler::new`]
//! - sync closures/functions - [`Handler::sync`]
//! - struct-based handlers - [`EventHandler`] via [`Handler::from_handler`]
//! - forwarding onto another bus - [`Handler::forward`]
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{Handler, HandlerOutput};
//!
//! bus.on("Ping", Handler::new("pong", |_event| async move {
//!     HandlerOutput::json(&"pong")
//! }));
//!
//! // Chain buses: everything on `frontend` also lands on `backend`.
//! frontend.on("*", Handler::forward(&backend));
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::BusError;
use crate::event::{Event, EventPayload};

/// What a handler invocation produced.
#[derive(Debug)]
pub enum HandlerOutput {
    /// A JSON return value, validated against the event's declared result
    /// kind if one was set.
    Value(Value),
    /// The event was forwarded; validation is skipped for this shape.
    Event(Event),
    /// Nothing to record.
    None,
}

impl HandlerOutput {
    /// Serialize any value into a JSON handler output.
    pub fn json<T: Serialize>(value: &T) -> anyhow::Result<HandlerOutput> {
        Ok(HandlerOutput::Value(serde_json::to_value(value)?))
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        HandlerOutput::Value(value)
    }
}

impl From<Event> for HandlerOutput {
    fn from(event: Event) -> Self {
        HandlerOutput::Event(event)
    }
}

impl From<()> for HandlerOutput {
    fn from(_: ()) -> Self {
        HandlerOutput::None
    }
}

/// A struct-based event handler.
///
/// The "bound method" registration shape: state lives on the struct, the
/// handler name defaults to the type name.
///
/// # Example
///
/// ```ignore
/// use conveyor::{Event, EventHandler, Handler, HandlerOutput};
///
/// struct StockReserver {
///     warehouse: Warehouse,
/// }
///
/// #[async_trait::async_trait]
/// impl EventHandler for StockReserver {
///     async fn handle(&self, event: Event) -> anyhow::Result<HandlerOutput> {
///         self.warehouse.reserve(event.payload()?).await?;
///         Ok(HandlerOutput::None)
///     }
/// }
///
/// bus.on("OrderPlaced", Handler::from_handler(StockReserver { warehouse }));
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Display name used in results and logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle one event.
    async fn handle(&self, event: Event) -> anyhow::Result<HandlerOutput>;
}

type SyncFn = Arc<dyn Fn(Event) -> anyhow::Result<HandlerOutput> + Send + Sync>;
type AsyncFn = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<HandlerOutput>> + Send + Sync>;

/// The normalized call shape, fixed at registration.
#[derive(Clone)]
pub(crate) enum HandlerKind {
    Sync(SyncFn),
    Async(AsyncFn),
    /// Dispatch the event onto the target bus. Tracked as its own shape so
    /// the loop guard can check the target against the event path.
    Forward(EventBus),
}

/// A registered callback with a stable identity.
#[derive(Clone)]
pub struct Handler {
    pub(crate) uid: String,
    pub(crate) name: String,
    pub(crate) timeout: Option<Duration>,
    pub(crate) kind: HandlerKind,
}

impl Handler {
    /// Register an async callable.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Handler
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HandlerOutput>> + Send + 'static,
    {
        Handler {
            uid: Uuid::now_v7().to_string(),
            name: name.into(),
            timeout: None,
            kind: HandlerKind::Async(Arc::new(move |event| Box::pin(f(event)))),
        }
    }

    /// Register a sync callable. Sync handlers run inline on the bus's run
    /// loop and cannot be interrupted by timeouts; keep them short.
    pub fn sync<F>(name: impl Into<String>, f: F) -> Handler
    where
        F: Fn(Event) -> anyhow::Result<HandlerOutput> + Send + Sync + 'static,
    {
        Handler {
            uid: Uuid::now_v7().to_string(),
            name: name.into(),
            timeout: None,
            kind: HandlerKind::Sync(Arc::new(f)),
        }
    }

    /// Register a struct-based handler.
    pub fn from_handler<H: EventHandler>(handler: H) -> Handler {
        let name = handler.name().to_string();
        let handler = Arc::new(handler);
        Handler {
            uid: Uuid::now_v7().to_string(),
            name,
            timeout: None,
            kind: HandlerKind::Async(Arc::new(move |event| {
                let handler = handler.clone();
                Box::pin(async move { handler.handle(event).await })
            })),
        }
    }

    /// A forwarding handler: its action is dispatching the event onto the
    /// target bus, chaining buses together. Skipped without error when the
    /// target's name is already in the event path.
    pub fn forward(target: &EventBus) -> Handler {
        Handler {
            uid: Uuid::now_v7().to_string(),
            name: format!("forward_to_{}", target.name()),
            timeout: None,
            kind: HandlerKind::Forward(target.clone()),
        }
    }

    /// Per-handler timeout override. Takes precedence over the event-level
    /// timeout and the bus default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The target bus name when this is a forwarding handler.
    pub(crate) fn forward_target(&self) -> Option<&EventBus> {
        match &self.kind {
            HandlerKind::Forward(target) => Some(target),
            _ => None,
        }
    }

    /// The is-async flag fixed at registration.
    #[allow(dead_code)]
    pub(crate) fn is_async(&self) -> bool {
        matches!(self.kind, HandlerKind::Async(_))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HandlerKind::Sync(_) => "sync",
            HandlerKind::Async(_) => "async",
            HandlerKind::Forward(_) => "forward",
        };
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// What a handler subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// An exact event type identifier.
    Type(String),
    /// Every event on the bus.
    Wildcard,
}

impl Pattern {
    /// The pattern for a typed payload.
    pub fn of<P: EventPayload>() -> Pattern {
        Pattern::Type(P::event_type().to_string())
    }

    /// The registry key this pattern indexes under.
    pub(crate) fn key(&self) -> &str {
        match self {
            Pattern::Type(event_type) => event_type,
            Pattern::Wildcard => "*",
        }
    }

    /// Validate the pattern at registration time.
    pub(crate) fn validate(&self) -> Result<(), BusError> {
        match self {
            Pattern::Wildcard => Ok(()),
            Pattern::Type(event_type) if crate::event::is_identifier(event_type) => Ok(()),
            Pattern::Type(event_type) => Err(BusError::Validation {
                message: format!("invalid event pattern {event_type:?}"),
            }),
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        if s == "*" {
            Pattern::Wildcard
        } else {
            Pattern::Type(s.to_string())
        }
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::from(s.as_str())
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
