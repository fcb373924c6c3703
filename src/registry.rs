//! Process-wide registry of live bus instances.
//!
//! The registry holds non-owning references, so dropping the last real
//! handle to a bus tears it down regardless of registration; dead entries
//! are pruned opportunistically. It exists for the cross-bus concerns:
//! ancestor lookup during completion propagation, cooperative draining
//! while a handler awaits, and unique-name enforcement at construction.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tracing::warn;
use uuid::Uuid;

use crate::bus::BusCore;
use crate::event::Event;

pub(crate) struct BusRegistry {
    buses: Mutex<Vec<Weak<BusCore>>>,
}

/// The registry shared by every bus in the process.
pub(crate) fn registry() -> &'static BusRegistry {
    static REGISTRY: OnceLock<BusRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| BusRegistry {
        buses: Mutex::new(Vec::new()),
    })
}

impl BusRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<Weak<BusCore>>> {
        self.buses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve a unique name and register the bus built with it, atomically
    /// with respect to other registrations.
    ///
    /// A name collision with a live bus auto-suffixes and warns rather than
    /// failing: colliding names are a caller bug worth surfacing, but not
    /// worth refusing to construct over.
    pub(crate) fn register(
        &self,
        requested: &str,
        build: impl FnOnce(String) -> Arc<BusCore>,
    ) -> Arc<BusCore> {
        let mut buses = self.lock();
        buses.retain(|weak| weak.strong_count() > 0);

        let taken = buses
            .iter()
            .filter_map(Weak::upgrade)
            .any(|core| core.name == requested);
        let name = if taken {
            let suffix = Uuid::now_v7().simple().to_string();
            let unique = format!("{requested}_{}", &suffix[suffix.len() - 8..]);
            warn!(
                requested,
                assigned = %unique,
                "bus name already in use, auto-generated a unique name; \
                 use unique names or stop(clear) unused buses"
            );
            unique
        } else {
            requested.to_string()
        };

        let core = build(name);
        buses.push(Arc::downgrade(&core));
        core
    }

    /// Drop the registration for a bus id (used by `stop(clear)`).
    pub(crate) fn deregister(&self, bus_id: &str) {
        self.lock().retain(|weak| {
            weak.upgrade()
                .map(|core| core.id != bus_id)
                .unwrap_or(false)
        });
    }

    /// All currently live buses.
    pub(crate) fn live(&self) -> Vec<Arc<BusCore>> {
        self.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Find an event by id in any live bus's history, together with the
    /// bus holding it.
    pub(crate) fn find_event(&self, event_id: &str) -> Option<(Arc<BusCore>, Event)> {
        for core in self.live() {
            if let Some(event) = core.history.get(event_id) {
                return Some((core, event));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    #[tokio::test]
    async fn test_duplicate_name_auto_suffixes() {
        let first = EventBus::new("collision_test_bus");
        let second = EventBus::new("collision_test_bus");
        assert_eq!(first.name(), "collision_test_bus");
        assert_ne!(second.name(), "collision_test_bus");
        assert!(second.name().starts_with("collision_test_bus_"));
    }

    #[tokio::test]
    async fn test_dropped_bus_frees_its_name() {
        {
            let _bus = EventBus::new("transient_name_bus");
        }
        // The previous owner is gone; the name is available again.
        let bus = EventBus::new("transient_name_bus");
        assert_eq!(bus.name(), "transient_name_bus");
    }

    #[tokio::test]
    async fn test_find_event_scans_live_histories() {
        let bus = EventBus::new("registry_lookup_bus");
        let event = bus.dispatch(crate::Event::new("Lookup").build()).unwrap();
        let (core, found) = registry().find_event(event.id()).unwrap();
        assert_eq!(core.name, "registry_lookup_bus");
        assert_eq!(found.id(), event.id());
        bus.stop(None, true).await;
    }
}
