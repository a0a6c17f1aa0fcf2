//! Coordination engine - registry -> hotkeys -> hooks -> feedback
//!
//! A run waits for the page to finish parsing, loads the registry, fills
//! missing hooks with stubs and installs the dispatcher. Matches flash the
//! item's target, invoke its hook and publish `vault:hotkey` on the bus.
//! A failed load is logged and leaves the page without shortcuts; there is
//! no retry.

use crate::bus::BusEvent;
use crate::dispatcher::{Dispatcher, DuplicatePolicy, InstallHandle, MatchHandler};
use crate::feedback::{Feedback, ensure_stubs};
use crate::hooks::HookSlot;
use crate::hotkey::KeyEvent;
use crate::namespace::Namespace;
use crate::registry::{LoadedRegistry, RegistryItem, RegistryLoader};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Uninitialized,
    /// Waiting for the page or fetching the registry
    Loading,
    /// Dispatcher installed
    Ready,
    /// Registry could not be loaded
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("an engine is already active on this namespace")]
    AlreadyActive,
}

struct Installed {
    registry: LoadedRegistry,
    handle: InstallHandle,
}

pub struct Engine {
    ns: Arc<Namespace>,
    loader: RegistryLoader,
    candidates: Vec<String>,
    policy: DuplicatePolicy,
    feedback: Feedback,
    state: watch::Sender<EngineState>,
    installed: Mutex<Option<Installed>>,
}

impl Engine {
    pub fn new(ns: Arc<Namespace>, loader: RegistryLoader, candidates: Vec<String>) -> Self {
        let feedback = Feedback::new(ns.page().clone());
        let (state, _) = watch::channel(EngineState::Uninitialized);
        Self {
            ns,
            loader,
            candidates,
            policy: DuplicatePolicy::default(),
            feedback,
            state,
            installed: Mutex::new(None),
        }
    }

    pub fn policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn flash_duration(mut self, flash: Duration) -> Self {
        self.feedback = self.feedback.flash_duration(flash);
        self
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// The registry the dispatcher was installed from.
    pub fn registry(&self) -> Option<LoadedRegistry> {
        self.slot().as_ref().map(|installed| installed.registry.clone())
    }

    fn slot(&self) -> MutexGuard<'_, Option<Installed>> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: EngineState) {
        debug!(?state, "engine state");
        self.state.send_replace(state);
        self.ns.set_engine_state(state);
    }

    /// Run the engine once. Resolves to `Ready` or `Failed`.
    ///
    /// Dropping the future before it resolves releases the namespace, so a
    /// run raced against a deadline can be retried.
    pub async fn run(&self) -> Result<EngineState, EngineError> {
        if !self.ns.claim_engine() {
            return Err(EngineError::AlreadyActive);
        }
        let mut claim = Claim {
            engine: self,
            settled: false,
        };

        self.ns.page().parsed().await;
        self.transition(EngineState::Loading);

        let state = match self.loader.load(&self.candidates).await {
            Ok(registry) => {
                self.install(registry);
                EngineState::Ready
            }
            Err(e) => {
                warn!("registry load failed, hotkeys disabled: {e}");
                self.transition(EngineState::Failed);
                EngineState::Failed
            }
        };
        claim.settled = true;
        Ok(state)
    }

    fn install(&self, registry: LoadedRegistry) {
        let hooks = self.ns.hooks();
        let stubs = ensure_stubs(&registry.items, hooks, &self.feedback);

        let dispatcher = Dispatcher::new(&registry.items, self.policy);
        let slots: HashMap<String, Arc<HookSlot>> = dispatcher
            .items()
            .iter()
            .filter(|item| !item.hook.trim().is_empty())
            .filter_map(|item| Some((item.hook.clone(), hooks.bind(&item.hook)?)))
            .collect();

        let handle = dispatcher.install(self.ns.page(), self.match_handler(slots));
        info!(
            url = %registry.url,
            items = registry.items.len(),
            active = handle.count(),
            stubs,
            "hotkeys installed"
        );

        let ready = BusEvent::Ready {
            url: registry.url.clone(),
            count: registry.items.len(),
        };
        *self.slot() = Some(Installed { registry, handle });
        self.transition(EngineState::Ready);
        self.ns.bus().emit(&ready);
    }

    fn match_handler(&self, slots: HashMap<String, Arc<HookSlot>>) -> MatchHandler {
        let bus = self.ns.bus().clone();
        let feedback = self.feedback.clone();

        Arc::new(move |item: &RegistryItem, event: &KeyEvent| {
            feedback.flash(item.feedback_token());

            let ok = slots
                .get(&item.hook)
                .is_some_and(|slot| slot.invoke(&json!({ "item": item, "event": event })));

            bus.emit(&BusEvent::Hotkey {
                id: item.id.clone(),
                name: item.name.clone(),
                hook: item.hook.clone(),
                ok,
            });
            info!(id = %item.id, ok, "hotkey");
        })
    }

    /// Remove the dispatcher. Returns `true` only for the call that removed
    /// it; the namespace is then free for a new run.
    pub fn uninstall(&self) -> bool {
        let removed = self
            .slot()
            .as_ref()
            .is_some_and(|installed| installed.handle.uninstall());
        if removed {
            self.transition(EngineState::Uninitialized);
        }
        removed
    }
}

/// Held for the duration of [`Engine::run`]. Resets the namespace when the
/// run is dropped before settling.
struct Claim<'a> {
    engine: &'a Engine,
    settled: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("engine run cancelled");
            self.engine.transition(EngineState::Uninitialized);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("candidates", &self.candidates)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
