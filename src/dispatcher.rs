//! Hotkey dispatcher - one key-down listener, first match wins
//!
//! The dispatcher snapshots the registry items that carry a hotkey and
//! attaches a single listener to the page. Events already consumed by someone
//! else, and events typed into text-entry targets, are ignored. Otherwise the
//! active list is scanned in registration order and the earliest item with an
//! equal signature fires; the event is then marked handled.

use crate::host::{KeyListener, ListenerId, Page};
use crate::hotkey::{HotkeySpec, KeyEvent};
use crate::registry::RegistryItem;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

/// What to do when several items bind the same hotkey.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep every binding; only the earliest-registered one ever fires
    #[default]
    FirstWins,
    /// Drop later duplicates from the active set when installing
    Reject,
}

/// Called with the matched item and the triggering event.
pub type MatchHandler = Arc<dyn Fn(&RegistryItem, &KeyEvent) + Send + Sync>;

/// Read-only snapshot of the items that can fire.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    active: Arc<[RegistryItem]>,
}

impl Dispatcher {
    pub fn new(items: &[RegistryItem], policy: DuplicatePolicy) -> Self {
        let mut first_owner: HashMap<&HotkeySpec, &str> = HashMap::new();
        let mut active = Vec::new();

        for item in items {
            let Some(hotkey) = &item.hotkey else {
                continue;
            };
            if let Some(owner) = first_owner.get(hotkey) {
                match policy {
                    DuplicatePolicy::FirstWins => {
                        debug!(id = %item.id, %hotkey, %owner, "duplicate hotkey, shadowed");
                    }
                    DuplicatePolicy::Reject => {
                        warn!(id = %item.id, %hotkey, %owner, "duplicate hotkey rejected");
                        continue;
                    }
                }
            } else {
                first_owner.insert(hotkey, &item.id);
            }
            active.push(item.clone());
        }

        Self {
            active: active.into(),
        }
    }

    pub fn items(&self) -> &[RegistryItem] {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Earliest active item bound to `signature`.
    pub fn find(&self, signature: &HotkeySpec) -> Option<&RegistryItem> {
        self.active
            .iter()
            .find(|item| item.hotkey.as_ref() == Some(signature))
    }

    /// Run one key event through the match rules.
    ///
    /// Returns the item that fired. `on_match` runs inside a panic boundary;
    /// the event is marked handled either way.
    pub fn handle(
        &self,
        event: &mut KeyEvent,
        on_match: &(dyn Fn(&RegistryItem, &KeyEvent) + Send + Sync),
    ) -> Option<&RegistryItem> {
        if event.default_prevented {
            trace!(key = %event.key, "already handled");
            return None;
        }
        if event.target.is_typing_target() {
            trace!(key = %event.key, "typing target, ignored");
            return None;
        }

        let signature = event.signature();
        let item = self.find(&signature)?;

        if panic::catch_unwind(AssertUnwindSafe(|| on_match(item, event))).is_err() {
            warn!(id = %item.id, "match handler panicked");
        }
        event.prevent_default();
        Some(item)
    }

    /// Attach the dispatcher to `page`.
    pub fn install(self, page: &Page, on_match: MatchHandler) -> InstallHandle {
        let count = self.len();
        let listener: KeyListener = Arc::new(move |event: &mut KeyEvent| {
            self.handle(event, on_match.as_ref());
        });
        let id = page.add_key_listener(listener);
        info!(count, "hotkey dispatcher installed");

        InstallHandle {
            page: page.clone(),
            id,
            installed: AtomicBool::new(true),
            count,
        }
    }
}

/// Removes the dispatcher's listener. Safe to call repeatedly.
#[derive(Debug)]
pub struct InstallHandle {
    page: Page,
    id: ListenerId,
    installed: AtomicBool,
    count: usize,
}

impl InstallHandle {
    /// Returns `true` only for the call that actually removed the listener.
    pub fn uninstall(&self) -> bool {
        if !self.installed.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.page.remove_key_listener(self.id);
        info!("hotkey dispatcher uninstalled");
        true
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Number of active bindings.
    pub fn count(&self) -> usize {
        self.count
    }
}
