//! Task-local execution context and the process-wide re-entrant lock.
//!
//! Event processing for *all* buses in the process is serialized behind one
//! mutual-exclusion primitive. Re-entrancy is tracked by a boolean flag
//! propagated through the logical call chain (a task-local, explicitly
//! scoped into any task the engine spawns), not by a recursive mutex -
//! a thread-keyed recursive lock would not survive crossing task
//! boundaries, while the flag travels wherever the chain goes.
//!
//! The same mechanism carries the handler scope: while a handler runs, the
//! current event and handler id are in scope, so a nested `dispatch` can
//! auto-parent the new event and record it as a child of the enclosing
//! handler's result.

use std::sync::OnceLock;

use tokio::sync::Semaphore;

use crate::event::Event;

tokio::task_local! {
    static HANDLER_SCOPE: HandlerScope;
    static HOLDS_GLOBAL_LOCK: bool;
}

/// Markers describing the handler currently executing on this call chain.
#[derive(Clone)]
pub(crate) struct HandlerScope {
    /// The event whose handler is running.
    pub event: Event,
    /// The per-bus id of the running handler.
    pub handler_id: String,
}

/// The handler scope of the current logical call chain, if any.
pub(crate) fn current_scope() -> Option<HandlerScope> {
    HANDLER_SCOPE.try_with(|scope| scope.clone()).ok()
}

/// True while the current call chain is inside a handler invocation.
pub(crate) fn inside_handler() -> bool {
    HANDLER_SCOPE.try_with(|_| ()).is_ok()
}

/// True while the current logical call chain holds the global lock.
pub(crate) fn holds_global_lock() -> bool {
    HOLDS_GLOBAL_LOCK.try_with(|held| *held).unwrap_or(false)
}

/// Wrap an async handler invocation in the handler scope, carrying the
/// current lock-ownership flag into the (possibly spawned) future.
pub(crate) fn scope_handler<F>(
    event: Event,
    handler_id: String,
    fut: F,
) -> impl std::future::Future<Output = F::Output>
where
    F: std::future::Future,
{
    let held = holds_global_lock();
    HOLDS_GLOBAL_LOCK.scope(held, HANDLER_SCOPE.scope(HandlerScope { event, handler_id }, fut))
}

/// Wrap a synchronous handler invocation in the handler scope.
pub(crate) fn sync_scope_handler<T>(
    event: Event,
    handler_id: String,
    f: impl FnOnce() -> T,
) -> T {
    HANDLER_SCOPE.sync_scope(HandlerScope { event, handler_id }, f)
}

/// Carry the current lock-ownership flag into a future about to be spawned
/// as a separate task.
pub(crate) fn propagate_lock<F>(fut: F) -> impl std::future::Future<Output = F::Output>
where
    F: std::future::Future,
{
    let held = holds_global_lock();
    HOLDS_GLOBAL_LOCK.scope(held, fut)
}

/// A lock that is re-entrant per logical call chain.
///
/// One permit guards event processing process-wide. A chain that already
/// holds the permit (flag in scope) runs the critical section directly,
/// so a handler that synchronously drives another bus never deadlocks
/// against itself, while unrelated chains still serialize.
pub(crate) struct ReentrantLock {
    semaphore: Semaphore,
}

impl ReentrantLock {
    pub(crate) fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
        }
    }

    /// Run `fut` inside the critical section, re-entrantly.
    pub(crate) async fn run<F>(&self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        if holds_global_lock() {
            return fut.await;
        }
        // The semaphore is never closed; acquire only fails after close,
        // in which case exclusion is moot and we proceed.
        let _permit = self.semaphore.acquire().await.ok();
        HOLDS_GLOBAL_LOCK.scope(true, fut).await
    }

    /// Whether the critical section is currently occupied.
    #[cfg(test)]
    pub(crate) fn locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

/// The global lock shared by every bus instance in the process.
pub(crate) fn global_lock() -> &'static ReentrantLock {
    static LOCK: OnceLock<ReentrantLock> = OnceLock::new();
    LOCK.get_or_init(ReentrantLock::new)
}
