//! Loop and recursion detection.
//!
//! Three independent guards keep event flow acyclic:
//! 1. a handler never runs twice for the same event (any existing result,
//!    pending or terminal, skips it);
//! 2. a forwarding handler is skipped, without error, when its target bus
//!    name already appears in the event's path;
//! 3. non-forwarding handlers face a causal recursion bound: the number of
//!    ancestor events this same handler id already processed may not
//!    exceed the bus's `recursion_limit`.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::bus::RegisteredHandler;
use crate::error::BusError;
use crate::event::Event;
use crate::registry::registry;

/// Decide whether a handler should be skipped for this event.
///
/// `Ok(true)` means skip quietly; `Err(RecursionLimitExceeded)` is fatal
/// for the event being processed.
pub(crate) fn should_skip(
    bus_name: &str,
    recursion_limit: usize,
    event: &Event,
    registered: &RegisteredHandler,
) -> Result<bool, BusError> {
    // Forwarding cycle: the target bus already saw this event.
    if let Some(target) = registered.handler.forward_target() {
        if event.path().iter().any(|name| name == target.name()) {
            debug!(
                bus = bus_name,
                handler = registered.handler.name(),
                target = target.name(),
                event = %event,
                "skipping forward, target already in event path"
            );
            return Ok(true);
        }
    }

    // Idempotence: one result per (event, handler), ever.
    if let Some(existing) = event.result_for(&registered.id) {
        debug!(
            bus = bus_name,
            handler = registered.handler.name(),
            status = %existing.status(),
            event = %event,
            "skipping handler, result already recorded for this event"
        );
        return Ok(true);
    }

    // Causal self-recursion bound, forwarding handlers exempt (they may
    // chain at any depth; the path check above already bounds them).
    if registered.handler.forward_target().is_none() {
        let depth = ancestor_depth(event, &registered.id);
        if depth > recursion_limit {
            return Err(BusError::RecursionLimitExceeded {
                handler: registered.handler.name().to_string(),
                depth,
            });
        }
        if depth == recursion_limit && recursion_limit > 0 {
            warn!(
                bus = bus_name,
                handler = registered.handler.name(),
                depth,
                "handler at maximum recursion depth, the next level will fail"
            );
        }
    }

    Ok(false)
}

/// How many ancestors of `event` this handler id already processed.
///
/// Walks parent links across every live bus's history. Visited-set guarded:
/// malformed or cyclic parent chains terminate instead of recursing
/// forever, and an unfound ancestor ends the walk.
fn ancestor_depth(event: &Event, handler_id: &str) -> usize {
    let mut visited: HashSet<String> = HashSet::new();
    let mut depth = 0;
    let mut current = event.clone();

    loop {
        if !visited.insert(current.id().to_string()) {
            return depth;
        }
        let Some(parent_id) = current.parent_id() else {
            return depth;
        };
        let Some((_, parent)) = registry().find_event(&parent_id) else {
            return depth;
        };
        if let Some(result) = parent.result_for(handler_id) {
            // An error result does not count: the handler never completed
            // that level of the chain.
            if result.error().is_none() {
                depth += 1;
            }
        }
        current = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::handler::{Handler, HandlerOutput};
    use crate::result::EventResult;

    fn registered(bus: &EventBus, handler: Handler) -> RegisteredHandler {
        RegisteredHandler {
            id: format!("{}.{}", bus.id(), handler.uid),
            handler,
        }
    }

    fn record_result(event: &Event, handler_id: &str) {
        let result = EventResult::new(event, handler_id, "h", "b", "bus", None);
        result.record_output(HandlerOutput::None);
        event.add_result(result);
    }

    #[tokio::test]
    async fn test_forward_skipped_when_target_in_path() {
        let source = EventBus::new("guard_source");
        let target = EventBus::new("guard_target");
        let forward = registered(&source, Handler::forward(&target));

        let event = Event::new("E").build();
        event.push_path("guard_target");
        assert!(should_skip("guard_source", 2, &event, &forward).unwrap());

        let fresh = Event::new("E").build();
        fresh.push_path("guard_source");
        assert!(!should_skip("guard_source", 2, &fresh, &forward).unwrap());
    }

    #[tokio::test]
    async fn test_existing_result_skips_rerun() {
        let bus = EventBus::new("guard_idempotent");
        let handler = registered(&bus, Handler::sync("h", |_| Ok(HandlerOutput::None)));
        let event = Event::new("E").build();
        assert!(!should_skip("guard_idempotent", 2, &event, &handler).unwrap());

        record_result(&event, &handler.id);
        assert!(should_skip("guard_idempotent", 2, &event, &handler).unwrap());
    }

    #[tokio::test]
    async fn test_recursion_depth_counts_ancestors() {
        let bus = EventBus::new("guard_recursion");
        let handler = registered(&bus, Handler::sync("h", |_| Ok(HandlerOutput::None)));

        // Build a chain root -> mid -> leaf where the handler processed
        // both ancestors. Events must be in a live history for the walk.
        let root = Event::new("Root").build();
        record_result(&root, &handler.id);
        let mid = Event::new("Mid").parent(root.id()).build();
        record_result(&mid, &handler.id);
        let leaf = Event::new("Leaf").parent(mid.id()).build();

        bus.insert_history(root);
        bus.insert_history(mid);

        // Depth 2 with limit 2: allowed, saturation warning territory.
        assert!(!should_skip("guard_recursion", 2, &leaf, &handler).unwrap());
        // Depth 2 with limit 1: fatal.
        let err = should_skip("guard_recursion", 1, &leaf, &handler).unwrap_err();
        assert!(matches!(
            err,
            BusError::RecursionLimitExceeded { depth: 2, .. }
        ));
        bus.stop(None, true).await;
    }

    #[tokio::test]
    async fn test_cyclic_parent_chain_terminates() {
        let bus = EventBus::new("guard_cycle");
        let handler = registered(&bus, Handler::sync("h", |_| Ok(HandlerOutput::None)));

        let a = Event::new("A").build();
        let b = Event::new("B").parent(a.id()).build();
        a.set_parent(b.id().to_string());
        bus.insert_history(a);
        bus.insert_history(b.clone());

        // Must return, not hang or overflow.
        assert!(!should_skip("guard_cycle", 2, &b, &handler).unwrap());
        bus.stop(None, true).await;
    }
}
