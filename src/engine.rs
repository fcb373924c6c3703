//! The run loop and handler execution.
//!
//! One consumer per bus: an event is fully processed - all applicable
//! handlers settled - before the next is dequeued, which alone provides
//! event-level FIFO ordering. Processing happens inside the process-wide
//! re-entrant lock so one logical chain may cross buses without
//! deadlocking itself while unrelated chains serialize.
//!
//! ```text
//! dispatch ─► queue ─► run loop ─► registry lookup ─► loop guard
//!                                        │
//!                         serial or parallel handler execution
//!                                        │
//!                    results ─► WAL ─► eviction ─► completion
//!                                        │
//!                        parent-chain re-evaluation (all buses)
//! ```
//!
//! Failure semantics: a handler failure lands on that handler's result and
//! never crashes the loop; orchestration errors are logged and the loop
//! continues; only shutdown stops it, and it exits cleanly.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use tokio::task::JoinError;
use tracing::{debug, error, warn};

use crate::bus::{EventBus, RegisteredHandler, CANCEL_GRACE, QUEUE_POLL_INTERVAL};
use crate::context;
use crate::error::{BusError, ResultError};
use crate::event::Event;
use crate::handler::{HandlerKind, HandlerOutput};
use crate::loop_guard;
use crate::queue::Pop;
use crate::registry::registry;
use crate::result::EventResult;

/// Rounds of cooperative draining before an in-handler wait gives up.
const MAX_DRAIN_ROUNDS: usize = 1000;

/// Main per-bus consumer loop.
pub(crate) async fn run_loop(bus: EventBus) {
    debug!(bus = %bus.name(), "run loop started");
    loop {
        if !bus.core.running.load(Ordering::Acquire) {
            break;
        }
        match bus.core.queue.pop(QUEUE_POLL_INTERVAL).await {
            Pop::Item(event) => {
                let processed = context::global_lock()
                    .run(bus.process_event(event.clone()))
                    .await;
                if let Err(err) = processed {
                    error!(
                        bus = %bus.name(),
                        event = %event,
                        error = %err,
                        "error while processing event"
                    );
                }
                if bus.is_quiescent() {
                    bus.core.idle.notify_waiters();
                }
            }
            Pop::Idle => {
                if bus.is_quiescent() {
                    bus.core.idle.notify_waiters();
                }
            }
            Pop::Shutdown => break,
        }
    }
    bus.core.running.store(false, Ordering::Release);
    bus.core.idle.notify_waiters();
    debug!(bus = %bus.name(), "run loop exited");
}

enum Exec {
    Output(HandlerOutput),
    Failed(anyhow::Error),
    TimedOut,
    Cancelled,
}

/// Aborts a handler task and records a cancelled result if the execution
/// future itself is dropped mid-await (an ancestor's timeout aborted the
/// chain this handler was running inside). Disarmed on every normal path.
struct CancelGuard {
    result: EventResult,
    handler_name: String,
    abort: tokio::task::AbortHandle,
    armed: bool,
}

impl CancelGuard {
    fn new(result: EventResult, handler_name: String, abort: tokio::task::AbortHandle) -> Self {
        Self {
            result,
            handler_name,
            abort,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.abort.abort();
            // No-op if the handler already settled.
            self.result.record_error(ResultError::cancelled(format!(
                "handler {} was interrupted by a parent cancellation",
                self.handler_name
            )));
        }
    }
}

fn exec_from_join(joined: Result<anyhow::Result<HandlerOutput>, JoinError>) -> Exec {
    match joined {
        Ok(Ok(output)) => Exec::Output(output),
        Ok(Err(err)) => Exec::Failed(err),
        Err(join_err) if join_err.is_panic() => {
            Exec::Failed(anyhow::anyhow!("handler panicked: {join_err}"))
        }
        Err(_) => Exec::Cancelled,
    }
}

impl EventBus {
    /// Fully process one event: select handlers, record results, execute,
    /// persist, evict, and propagate completion. Assumes the caller holds
    /// the global lock (the run loop or a cooperative drain).
    pub(crate) async fn process_event(&self, event: Event) -> Result<(), BusError> {
        debug!(bus = %self.name(), event = %event, "processing event");
        let applicable = self.applicable_handlers(&event)?;

        // Pending results exist before execution so the event knows it has
        // handlers and cannot settle prematurely. Idempotent: a result
        // already present (re-dispatch) is left alone.
        for registered in &applicable {
            if event.result_for(&registered.id).is_none() {
                let timeout = registered
                    .handler
                    .timeout
                    .or_else(|| event.timeout())
                    .or(self.core.config.default_event_timeout);
                event.add_result(EventResult::new(
                    &event,
                    registered.id.clone(),
                    registered.handler.name.clone(),
                    self.core.id.clone(),
                    self.core.name.clone(),
                    timeout,
                ));
            }
        }

        if applicable.is_empty() {
            event.stamp_processed();
        } else if self.core.config.parallel_handlers {
            let mut tasks = Vec::with_capacity(applicable.len());
            for registered in applicable {
                let bus = self.clone();
                let event = event.clone();
                let task = tokio::spawn(context::propagate_lock(async move {
                    bus.execute_handler(event, registered).await;
                }));
                self.track_inflight(task.abort_handle());
                tasks.push(task);
            }
            // Join everything; one handler's failure never cancels siblings.
            for joined in futures::future::join_all(tasks).await {
                if let Err(err) = joined {
                    error!(bus = %self.name(), error = %err, "handler task died");
                }
            }
        } else {
            // Registration order, each fully awaited. A failure is local to
            // its result; later handlers still run.
            for registered in applicable {
                self.execute_handler(event.clone(), registered).await;
            }
        }

        let newly_complete = event.mark_complete_if_settled();
        if newly_complete {
            if let Some(wal) = &self.core.wal {
                wal.append(&event.to_record()).await;
            }
        }
        self.core.history.evict();
        self.propagate_completion(&event).await;
        Ok(())
    }

    /// Handlers for the exact type plus wildcard handlers, loop-guard
    /// filtered.
    fn applicable_handlers(&self, event: &Event) -> Result<Vec<RegisteredHandler>, BusError> {
        let mut candidates: Vec<RegisteredHandler> = Vec::new();
        if let Some(typed) = self.core.handlers.get(event.event_type()) {
            candidates.extend(typed.iter().cloned());
        }
        if let Some(wildcard) = self.core.handlers.get("*") {
            candidates.extend(wildcard.iter().cloned());
        }

        let mut applicable = Vec::with_capacity(candidates.len());
        for registered in candidates {
            let skip = loop_guard::should_skip(
                self.name(),
                self.core.config.recursion_limit,
                event,
                &registered,
            )?;
            if !skip {
                applicable.push(registered);
            }
        }
        Ok(applicable)
    }

    /// Execute one handler under its effective timeout, recording the
    /// outcome on its result. Never returns an error: every failure mode
    /// lands on the result.
    pub(crate) async fn execute_handler(&self, event: Event, registered: RegisteredHandler) {
        let Some(result) = event.result_for(&registered.id) else {
            error!(
                bus = %self.name(),
                handler = %registered.handler.name,
                event = %event,
                "no result record for handler, skipping execution"
            );
            return;
        };
        if result.started_at().is_some() {
            warn!(
                bus = %self.name(),
                handler = %registered.handler.name,
                event = %event,
                "handler already executed for this event, skipping"
            );
            return;
        }
        result.mark_started();
        debug!(
            bus = %self.name(),
            handler = %registered.handler.name,
            event = %event,
            "handler started"
        );

        // Watchdog: flags slow handlers (it may be awaiting its own result
        // or blocked behind another chain). Logs only, never cancels.
        let watchdog = {
            let bus_name = self.core.name.clone();
            let handler_name = registered.handler.name.clone();
            let shown = event.to_string();
            let after = self.core.config.watchdog_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                warn!(
                    bus = %bus_name,
                    handler = %handler_name,
                    event = %shown,
                    running_for = ?after,
                    "handler still running, possible slow processing or deadlock"
                );
            })
        };

        let effective_timeout = result.timeout();
        let exec = match registered.handler.kind.clone() {
            HandlerKind::Forward(target) => {
                let forwarded = context::sync_scope_handler(
                    event.clone(),
                    registered.id.clone(),
                    || target.dispatch(event.clone()),
                );
                match forwarded {
                    Ok(forwarded) => Exec::Output(HandlerOutput::Event(forwarded)),
                    Err(err) => Exec::Failed(anyhow::Error::new(err)),
                }
            }
            HandlerKind::Sync(f) => {
                // Sync handlers run inline on the consumer; they block the
                // loop and cannot be interrupted by the timeout.
                let outcome = context::sync_scope_handler(
                    event.clone(),
                    registered.id.clone(),
                    || f(event.clone()),
                );
                match outcome {
                    Ok(output) => Exec::Output(output),
                    Err(err) => Exec::Failed(err),
                }
            }
            HandlerKind::Async(f) => {
                let fut = context::scope_handler(event.clone(), registered.id.clone(), f(event.clone()));
                let mut task = tokio::spawn(fut);
                self.track_inflight(task.abort_handle());
                let mut guard = CancelGuard::new(
                    result.clone(),
                    registered.handler.name.clone(),
                    task.abort_handle(),
                );
                let exec = match effective_timeout {
                    Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                        Ok(joined) => exec_from_join(joined),
                        Err(_) => {
                            // Best-effort cancellation: a short grace to
                            // finish, then abort and wait for teardown so
                            // nested cancellations land before this
                            // handler's children are swept. A task that
                            // survives both graces is abandoned.
                            if tokio::time::timeout(CANCEL_GRACE, &mut task).await.is_err() {
                                task.abort();
                                let _ = tokio::time::timeout(CANCEL_GRACE, &mut task).await;
                            }
                            Exec::TimedOut
                        }
                    },
                    None => exec_from_join(task.await),
                };
                guard.disarm();
                exec
            }
        };
        watchdog.abort();

        match exec {
            Exec::Output(output) => {
                result.record_output(output);
                debug!(
                    bus = %self.name(),
                    handler = %registered.handler.name,
                    status = %result.status(),
                    "handler finished"
                );
            }
            Exec::Failed(err) => {
                error!(
                    bus = %self.name(),
                    handler = %registered.handler.name,
                    event = %event,
                    error = %format!("{err:#}"),
                    "handler failed"
                );
                result.record_error(ResultError::handler(format!("{err:#}")));
            }
            Exec::Cancelled => {
                result.record_error(ResultError::cancelled(format!(
                    "handler {} was cancelled before completing",
                    registered.handler.name
                )));
            }
            Exec::TimedOut => {
                let children = result.children().len();
                let note = if children > 0 {
                    format!(" and cancelled processing of {children} child events")
                } else {
                    String::new()
                };
                let message = format!(
                    "handler {} timed out after {:?}{note}",
                    registered.handler.name,
                    effective_timeout.unwrap_or_default()
                );
                warn!(
                    bus = %self.name(),
                    handler = %registered.handler.name,
                    event = %event,
                    timeout = ?effective_timeout,
                    "handler timed out"
                );
                result.record_error(ResultError::timeout(message.clone()));
                result.cancel_pending_children(&message);
            }
        }
    }

    /// Walk up the parent chain across all live buses, re-evaluating
    /// completion for each ancestor - a parent may have been waiting only
    /// on this subtree. Stops at an unfound or already-complete ancestor;
    /// visited-set guarded against cyclic parent links.
    async fn propagate_completion(&self, event: &Event) {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = event.clone();
        while let Some(parent_id) = current.parent_id() {
            if !visited.insert(parent_id.clone()) {
                break;
            }
            let Some((core, parent)) = registry().find_event(&parent_id) else {
                break;
            };
            if parent.is_complete() {
                break;
            }
            if parent.mark_complete_if_settled() {
                debug!(
                    bus = %core.name,
                    event = %parent,
                    "ancestor completed after subtree settled"
                );
                if let Some(wal) = &core.wal {
                    wal.append(&parent.to_record()).await;
                }
            }
            current = parent;
        }
    }
}

/// Service ready work from every live bus until `event` completes.
///
/// Used when a handler awaits an event while its chain holds the global
/// lock: blocking on the signal would deadlock, because the loop that must
/// make progress is the one we are running on. One queued event is
/// processed at a time, across all buses, with a bound so a wait that can
/// never complete does not spin forever.
pub(crate) async fn drain_until_complete(event: &Event) {
    for _ in 0..MAX_DRAIN_ROUNDS {
        if event.is_complete() {
            return;
        }
        let mut processed_any = false;
        for core in registry().live() {
            let Some(next) = core.queue.try_pop() else {
                continue;
            };
            let bus = EventBus::from_core(core);
            if let Err(err) = bus.process_event(next.clone()).await {
                error!(
                    bus = %bus.name(),
                    event = %next,
                    error = %err,
                    "error processing event during cooperative drain"
                );
            }
            processed_any = true;
            if event.is_complete() {
                return;
            }
        }
        if !processed_any {
            tokio::task::yield_now().await;
        }
    }
    warn!(event = %event, "cooperative drain bound reached before completion");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_event_with_no_handlers_completes() {
        let bus = EventBus::new("engine_no_handlers");
        let event = bus.dispatch(Event::new("Unhandled").build()).unwrap();
        let completed = event
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(completed.is_complete());
        assert!(completed.processed_at().is_some());
        assert!(completed.event_results().is_empty());
        bus.stop(None, true).await;
    }

    #[tokio::test]
    async fn test_wildcard_and_typed_handlers_both_run() {
        let bus = EventBus::new("engine_wildcard");
        let typed_runs = Arc::new(AtomicUsize::new(0));
        let wildcard_runs = Arc::new(AtomicUsize::new(0));
        {
            let typed_runs = typed_runs.clone();
            bus.on(
                "Ping",
                Handler::sync("typed", move |_| {
                    typed_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutput::None)
                }),
            );
        }
        {
            let wildcard_runs = wildcard_runs.clone();
            bus.on(
                "*",
                Handler::sync("wildcard", move |_| {
                    wildcard_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutput::None)
                }),
            );
        }

        bus.dispatch(Event::new("Ping").build())
            .unwrap()
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        bus.dispatch(Event::new("Other").build())
            .unwrap()
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(typed_runs.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard_runs.load(Ordering::SeqCst), 2);
        bus.stop(None, true).await;
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated() {
        let bus = EventBus::new("engine_isolation");
        bus.on(
            "E",
            Handler::sync("fails", |_| Err(anyhow::anyhow!("intentional"))),
        );
        bus.on(
            "E",
            Handler::sync("succeeds", |_| Ok(HandlerOutput::Value(json!("ok")))),
        );

        let event = bus
            .dispatch(Event::new("E").build())
            .unwrap()
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();

        let results = event.event_results();
        assert_eq!(results.len(), 2);
        let failed = results.iter().find(|r| r.handler_name() == "fails").unwrap();
        assert!(failed.error().unwrap().message.contains("intentional"));
        let fine = results
            .iter()
            .find(|r| r.handler_name() == "succeeds")
            .unwrap();
        assert_eq!(fine.json_value(), Some(json!("ok")));
        bus.stop(None, true).await;
    }

    #[tokio::test]
    async fn test_handler_panic_is_isolated() {
        let bus = EventBus::new("engine_panic");
        bus.on(
            "E",
            Handler::new("panics", |_| async { panic!("handler blew up") }),
        );
        bus.on(
            "E",
            Handler::sync("survives", |_| Ok(HandlerOutput::Value(json!(1)))),
        );

        let event = bus
            .dispatch(Event::new("E").build())
            .unwrap()
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();

        let panicked = event
            .event_results()
            .into_iter()
            .find(|r| r.handler_name() == "panics")
            .unwrap();
        assert!(panicked.error().unwrap().message.contains("panicked"));
        let survivor = event
            .event_results()
            .into_iter()
            .find(|r| r.handler_name() == "survives")
            .unwrap();
        assert_eq!(survivor.json_value(), Some(json!(1)));
        bus.stop(None, true).await;
    }

    #[tokio::test]
    async fn test_per_handler_timeout_override_wins() {
        let bus = EventBus::new("engine_handler_timeout");
        bus.on(
            "E",
            Handler::new("bounded", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(HandlerOutput::None)
            })
            .with_timeout(Duration::from_millis(50)),
        );

        let started = tokio::time::Instant::now();
        let event = bus
            .dispatch(Event::new("E").timeout(Duration::from_secs(60)).build())
            .unwrap()
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let result = &event.event_results()[0];
        assert!(result.error().unwrap().is_timeout());
        bus.stop(None, true).await;
    }

    #[tokio::test]
    async fn test_nested_dispatch_parents_and_tracks_child() {
        let bus = EventBus::new("engine_nesting");
        {
            let child_bus = bus.clone();
            bus.on(
                "Parent",
                Handler::new("spawner", move |_| {
                    let child_bus = child_bus.clone();
                    async move {
                        child_bus.dispatch(Event::new("Child").build())?;
                        Ok(HandlerOutput::None)
                    }
                }),
            );
        }

        let parent = bus
            .dispatch(Event::new("Parent").build())
            .unwrap()
            .wait_timeout(Duration::from_secs(2))
            .await
            .unwrap();

        let children = parent.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].event_type(), "Child");
        assert_eq!(children[0].parent_id().as_deref(), Some(parent.id()));
        bus.stop(Some(Duration::from_secs(2)), true).await;
    }

    #[tokio::test]
    async fn test_await_inside_handler_drains_inline() {
        let bus = EventBus::new("engine_inline_await");
        {
            let inner_bus = bus.clone();
            bus.on(
                "Outer",
                Handler::new("awaits_child", move |_| {
                    let inner_bus = inner_bus.clone();
                    async move {
                        let child = inner_bus.dispatch(Event::new("Inner").build())?;
                        // Without cooperative draining this would deadlock:
                        // the loop that must process Inner is awaiting us.
                        let completed = child.wait().await?;
                        HandlerOutput::json(&completed.is_complete())
                    }
                }),
            );
        }
        bus.on("Inner", Handler::sync("inner", |_| Ok(HandlerOutput::Value(json!("inner_done")))));

        let outer = bus
            .dispatch(Event::new("Outer").build())
            .unwrap()
            .wait_timeout(Duration::from_secs(5))
            .await
            .unwrap();

        let outer_result = outer
            .event_results()
            .into_iter()
            .find(|r| r.handler_name() == "awaits_child")
            .unwrap();
        assert_eq!(outer_result.json_value(), Some(json!(true)));
        bus.stop(Some(Duration::from_secs(2)), true).await;
    }

    #[tokio::test]
    async fn test_recursion_limit_logs_and_stops_processing() {
        let bus = EventBus::builder("engine_recursion")
            .recursion_limit(1)
            .build();
        {
            let rebus = bus.clone();
            bus.on(
                "Echo",
                Handler::new("echoer", move |_| {
                    let rebus = rebus.clone();
                    async move {
                        rebus.dispatch(Event::new("Echo").build())?;
                        Ok(HandlerOutput::None)
                    }
                }),
            );
        }

        bus.dispatch(Event::new("Echo").build()).unwrap();
        // The chain must terminate: first echo runs, the grandchild trips
        // the limit and its processing aborts rather than echoing forever.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let processed = bus.events_completed().len() + bus.events_started().len();
        assert!(processed >= 1);
        assert!(bus.core.history.len() < 10, "echo chain did not terminate");
        bus.stop(None, true).await;
    }
}
