//! # Conveyor
//!
//! A single-consumer, in-process event bus: dispatch is synchronous,
//! handlers settle one event at a time, and completed events land in an
//! append-only log.
//!
//! ## Core Concepts
//!
//! - [`Event`] - the envelope: identity, payload, causal parent link, the
//!   path of buses it has visited, and a per-handler result map
//! - [`EventResult`] - one handler's execution record, with a monotonic
//!   status machine
//! - [`Handler`] - a registered callback (sync, async, struct-based, or
//!   forwarding), normalized at registration
//! - [`EventBus`] - one FIFO queue, one consumer loop, one handler registry
//!
//! ## Architecture
//!
//! ```text
//! producer ──dispatch()──► Queue ──► Run Loop (one consumer per bus)
//!                                        │
//!                              Registry lookup + Loop Guard
//!                                        │
//!                      Handler execution (serial or parallel)
//!                                │               │
//!                        EventResult updates   nested dispatch()
//!                                │               │ (parented, tracked,
//!                                │               │  processed inline)
//!                      WAL append + history eviction
//!                                │
//!                  completion signal ──► parent-chain re-evaluation
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Event-level FIFO** - a bus fully processes one event before
//!    dequeuing the next; only handlers of a single event ever run
//!    concurrently, and only in parallel mode
//! 2. **One result per (event, handler)** - re-dispatching an event never
//!    re-runs a handler that already has a result
//! 3. **Failure isolation** - a handler error lands on its own result;
//!    siblings and the run loop are unaffected
//! 4. **Loops terminate** - forwarding stops when a bus name repeats in the
//!    event path, and causal self-recursion is depth-bounded
//! 5. **Backpressure over loss** - a full bus fails dispatch loudly instead
//!    of dropping events
//!
//! ## Guarantees
//!
//! - **In-process only**: no cross-process delivery
//! - **Completed-events audit log**: the WAL records finished events; it is
//!   not a durability mechanism for undelivered work
//! - **Bounded memory**: history evicts oldest-completed-first past its
//!   bound; in-flight events are never evicted while a completed one
//!   remains
//!
//! ## Example
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
//! // Chain buses: everything on `orders` also lands on `audit`.
//! let audit = EventBus::new("audit");
//! bus.on("*", Handler::forward(&audit));
//!
//! let event = bus.dispatch(Event::new("OrderPlaced").build())?;
//! let value = event.results().first_value().await?;
//! assert_eq!(value, serde_json::json!("reserved"));
//! ```

mod bus;
mod context;
mod engine;
mod error;
mod event;
mod handler;
mod history;
mod loop_guard;
mod queue;
mod registry;
mod result;
mod wal;


// Re-export bus types
pub use bus::{
    BusConfig, EventBus, EventBusBuilder, Expectation, DEFAULT_EVENT_TIMEOUT,
    DEFAULT_MAX_HISTORY, DEFAULT_MAX_PENDING, DEFAULT_RECURSION_LIMIT, DEFAULT_WATCHDOG_TIMEOUT,
};

// Re-export event types
pub use event::{Event, EventBuilder, EventId, EventPayload, EventRecord, EventStatus, ValueKind};

// Re-export result types
pub use result::{EventResult, ResultRecord, ResultStatus, ResultValue, ResultsQuery};

// Re-export handler types
pub use handler::{EventHandler, Handler, HandlerOutput, Pattern};

// Re-export error types
pub use error::{BusError, ErrorKind, ResultError};

// Re-export commonly used external types
pub use async_trait::async_trait;
