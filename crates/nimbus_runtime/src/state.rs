//! Per-service shared state.

use crate::identity::IdentityMap;
use crate::keys::ServiceIdentity;
use crate::listeners::EventListeners;
use crate::registry::ClassRegistry;

/// Class registry, identity map and listener tables for one service.
///
/// Constructed explicitly by whoever builds the client and threaded through
/// every component that needs it.
#[derive(Debug)]
pub struct RuntimeState {
    registry: ClassRegistry,
    identity: IdentityMap,
    events: EventListeners,
}

impl RuntimeState {
    /// Creates state around a frozen registry.
    pub fn new(registry: ClassRegistry) -> Self {
        Self {
            registry,
            identity: IdentityMap::new(),
            events: EventListeners::new(),
        }
    }

    /// The service.
    pub fn service(&self) -> &ServiceIdentity {
        self.registry.service()
    }

    /// Class registry.
    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// Identity map.
    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    /// Event listener table.
    pub fn events(&self) -> &EventListeners {
        &self.events
    }
}
