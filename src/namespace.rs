//! Shared coordination namespace
//!
//! One [`Namespace`] is shared by every agent on a page: the bus, the hook
//! capability table and the engine lifecycle guard. Components receive it
//! explicitly instead of reaching for globals.

use crate::bus::{EventBus, VERSION};
use crate::engine::EngineState;
use crate::hooks::HookTable;
use crate::host::Page;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Namespace {
    bus: OnceLock<EventBus>,
    hooks: HookTable,
    page: Page,
    engine: Mutex<EngineState>,
}

impl Namespace {
    pub fn new(page: Page) -> Self {
        Self {
            bus: OnceLock::new(),
            hooks: HookTable::new(),
            page,
            engine: Mutex::new(EngineState::Uninitialized),
        }
    }

    /// The shared bus, created on first use.
    pub fn bus(&self) -> &EventBus {
        self.bus.get_or_init(|| {
            info!("online v{VERSION}");
            EventBus::new()
        })
    }

    /// Offer `bus` as the shared bus. An existing bus is kept and returned.
    pub fn install_bus(&self, bus: EventBus) -> &EventBus {
        let mut offered = Some(bus);
        let installed = self.bus.get_or_init(|| {
            info!("online v{VERSION}");
            offered.take().unwrap_or_default()
        });
        if offered.is_some() {
            debug!("bus already present, keeping existing");
        }
        installed
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    fn engine_slot(&self) -> MutexGuard<'_, EngineState> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// State of the most recent engine run on this namespace.
    pub fn engine_state(&self) -> EngineState {
        *self.engine_slot()
    }

    /// Reserve the namespace for a new engine run.
    ///
    /// Refused while another run is `Loading` or `Ready`. A granted claim
    /// counts as `Loading` until the run reports otherwise.
    pub fn claim_engine(&self) -> bool {
        let mut state = self.engine_slot();
        match *state {
            EngineState::Loading | EngineState::Ready => {
                debug!(state = ?*state, "engine already active");
                false
            }
            EngineState::Uninitialized | EngineState::Failed => {
                *state = EngineState::Loading;
                true
            }
        }
    }

    pub(crate) fn set_engine_state(&self, state: EngineState) {
        *self.engine_slot() = state;
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(Page::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_is_created_once() {
        let ns = Namespace::default();
        assert!(ns.bus().same_bus(ns.bus()));
    }

    #[test]
    fn install_bus_keeps_existing() {
        let ns = Namespace::default();
        let first = EventBus::new();
        assert!(ns.install_bus(first.clone()).same_bus(&first));

        let second = EventBus::new();
        assert!(ns.install_bus(second.clone()).same_bus(&first));
        assert!(!ns.bus().same_bus(&second));
    }

    #[test]
    fn claim_guard() {
        let ns = Namespace::default();
        assert_eq!(ns.engine_state(), EngineState::Uninitialized);

        assert!(ns.claim_engine());
        assert!(!ns.claim_engine());

        ns.set_engine_state(EngineState::Ready);
        assert!(!ns.claim_engine());

        ns.set_engine_state(EngineState::Failed);
        assert!(ns.claim_engine());
        assert_eq!(ns.engine_state(), EngineState::Loading);
    }

    #[test]
    fn root_namespace_exists() {
        let ns = Namespace::default();
        assert!(ns.hooks().has_namespace("vault"));
        assert!(ns.hooks().has_namespace("window.vault"));
    }
}
