//! Structured error types for the bus and for per-handler results.
//!
//! `BusError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Handler bodies may use `anyhow` internally as ergonomic
//! transport, but nothing `anyhow`-shaped ever crosses the bus boundary:
//! a failing handler is recorded on its own [`EventResult`](crate::EventResult)
//! as a [`ResultError`], and only the result accessors re-surface it as a
//! `BusError` when the caller asked for that.
//!
//! # Example
//!
//! ```ignore
//! use conveyor::BusError;
//!
//! match bus.dispatch(event) {
//!     Ok(event) => { /* awaitable */ }
//!     Err(BusError::CapacityExceeded { queued, processing, limit }) => {
//!         // backpressure: shed load or retry later
//!     }
//!     Err(other) => return Err(other.into()),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error type for bus operations.
///
/// Each variant includes enough context to act on the failure without
/// string-matching the message.
#[derive(Debug, Error)]
pub enum BusError {
    /// Malformed event metadata rejected at dispatch time.
    #[error("invalid event: {message}")]
    Validation {
        /// What was wrong with the event.
        message: String,
    },

    /// The bus refused a dispatch because too much work is already queued
    /// or in flight. This is backpressure, never a silent drop.
    #[error("bus at capacity: {queued} queued + {processing} processing (limit {limit})")]
    CapacityExceeded {
        /// Events waiting in the intake queue.
        queued: usize,
        /// Events in history that have not settled yet.
        processing: usize,
        /// The configured ceiling.
        limit: usize,
    },

    /// A handler exceeded its execution budget. Recorded as that handler's
    /// error result; in-flight child events it dispatched are cancelled.
    #[error("handler {handler} timed out after {timeout:?}")]
    HandlerTimeout {
        /// Display name of the handler.
        handler: String,
        /// The effective timeout that elapsed.
        timeout: Duration,
    },

    /// A handler returned an error. Isolated to that handler's result;
    /// sibling handlers are unaffected.
    #[error("handler {handler} failed: {message}")]
    HandlerError {
        /// Display name of the handler.
        handler: String,
        /// The recorded error message.
        message: String,
    },

    /// A handler has re-processed its own causal ancestors past the
    /// configured depth. Fatal for the event being processed.
    #[error("recursion limit exceeded: handler {handler} already processed {depth} ancestor events")]
    RecursionLimitExceeded {
        /// Display name of the handler.
        handler: String,
        /// How many ancestors the handler already processed.
        depth: usize,
    },

    /// The intake queue was shut down. Surfaces as a clean run-loop exit.
    #[error("event queue is shut down")]
    QueueShutdown,

    /// A wait (`wait_until_idle`, `expect`, result access) hit its deadline.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },

    /// `dispatch` was called outside a live async scheduling context.
    #[error("dispatch requires a running async runtime")]
    NoRuntime,

    /// A result accessor configured with `raise_if_none` found no matching
    /// result.
    #[error("no handler produced a matching result for {event}")]
    NoResults {
        /// Display form of the event that produced nothing.
        event: String,
    },

    /// Payload or record serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Flavor of a recorded per-handler error.
///
/// The kind survives WAL serialization so a timeout stays distinguishable
/// from an ordinary failure after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The handler itself returned an error.
    Handler,
    /// The handler exceeded its execution budget.
    Timeout,
    /// The handler (or a pending child result) was cancelled, usually as a
    /// consequence of an ancestor's timeout.
    Cancelled,
    /// The handler's return value did not match the declared result kind.
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Handler => write!(f, "handler"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Validation => write!(f, "validation"),
        }
    }
}

/// Error recorded on a single [`EventResult`](crate::EventResult).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    /// The failure flavor.
    pub kind: ErrorKind,
    /// Human-readable description, including the causal chain for
    /// cancellations.
    pub message: String,
}

impl ResultError {
    /// An ordinary handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Handler,
            message: message.into(),
        }
    }

    /// A timeout failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// A cancellation, causally linked to whatever interrupted the handler.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: message.into(),
        }
    }

    /// A result-kind validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }

    /// Returns true for timeout-flavored errors.
    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl fmt::Display for ResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_display() {
        let err = BusError::CapacityExceeded {
            queued: 40,
            processing: 60,
            limit: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("40 queued"));
        assert!(msg.contains("60 processing"));
        assert!(msg.contains("limit 100"));
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = BusError::HandlerTimeout {
            handler: "slow_handler".into(),
            timeout: Duration::from_millis(100),
        };
        match &err {
            BusError::HandlerTimeout { handler, timeout } => {
                assert_eq!(handler, "slow_handler");
                assert_eq!(*timeout, Duration::from_millis(100));
            }
            _ => panic!("expected HandlerTimeout"),
        }
    }

    #[test]
    fn test_result_error_roundtrip() {
        let err = ResultError::timeout("handler h timed out after 100ms");
        let json = serde_json::to_string(&err).unwrap();
        let back: ResultError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert!(back.is_timeout());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn test_recursion_display_names_handler() {
        let err = BusError::RecursionLimitExceeded {
            handler: "reentrant".into(),
            depth: 3,
        };
        assert!(err.to_string().contains("reentrant"));
        assert!(err.to_string().contains('3'));
    }
}
