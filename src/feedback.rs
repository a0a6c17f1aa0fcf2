//! Visual feedback and placeholder hooks
//!
//! Feedback only toggles classes on mounted page elements. A token locates its
//! element by exact `node`, then by the upper-cased token as `node`, then by
//! element id.

use crate::hooks::{HookTable, hook};
use crate::host::{ElementRef, Page};
use crate::registry::RegistryItem;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Class added for the duration of a flash.
pub const HIT_CLASS: &str = "hotkey-hit";

/// Class toggled by [`Feedback::set_detected`].
pub const DETECTED_CLASS: &str = "is-detected";

pub const DEFAULT_FLASH_MS: u64 = 260;

#[derive(Debug, Clone)]
pub struct Feedback {
    page: Page,
    flash: Duration,
}

impl Feedback {
    pub fn new(page: Page) -> Self {
        Self {
            page,
            flash: Duration::from_millis(DEFAULT_FLASH_MS),
        }
    }

    /// How long the hit class stays on.
    pub fn flash_duration(mut self, flash: Duration) -> Self {
        self.flash = flash;
        self
    }

    pub fn locate(&self, token: &str) -> Option<ElementRef> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        self.page
            .find_by_node(token, false)
            .or_else(|| self.page.find_by_node(&token.to_uppercase(), false))
            .or_else(|| self.page.find_by_id(token))
    }

    /// Briefly mark the element for `token`. Returns whether one was found.
    ///
    /// The class is removed on a tokio task when called inside a runtime,
    /// otherwise on a short-lived thread.
    pub fn flash(&self, token: &str) -> bool {
        let Some(element) = self.locate(token) else {
            trace!(%token, "no feedback target");
            return false;
        };
        self.page.toggle_class(element, HIT_CLASS, true);

        let page = self.page.clone();
        let delay = self.flash;
        let clear = move || page.toggle_class(element, HIT_CLASS, false);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    clear();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    clear();
                });
            }
        }
        true
    }

    pub fn set_detected(&self, token: &str, on: bool) -> bool {
        let Some(element) = self.locate(token) else {
            return false;
        };
        self.page.toggle_class(element, DETECTED_CLASS, on);
        true
    }
}

/// Install placeholder hooks for registry items whose action is missing.
///
/// A stub goes in only when the hook's parent namespace exists and nothing
/// callable sits at the path. It logs the item and flashes its target.
/// Returns the number of stubs installed.
pub fn ensure_stubs(items: &[RegistryItem], hooks: &HookTable, feedback: &Feedback) -> usize {
    let mut installed = 0;
    for item in items {
        if item.hook.trim().is_empty() {
            continue;
        }
        let id = item.id.clone();
        let token = item.feedback_token().to_string();
        let feedback = feedback.clone();
        let stub = hook(move |_| {
            info!(%id, "stub hook");
            feedback.flash(&token);
            Ok(())
        });
        if hooks.install_stub(&item.hook, stub) {
            debug!(id = %item.id, hook = %item.hook, "stub installed");
            installed += 1;
        }
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Element;
    use crate::registry::{Schema, normalize_registry};
    use serde_json::{Value, json};

    fn page_with_targets() -> Page {
        let page = Page::loaded();
        page.mount(Element::with_node("PAPER"));
        page.mount(Element::with_node("lux"));
        page.mount(Element::with_id("curves"));
        page
    }

    #[test]
    fn locate_order() {
        let page = page_with_targets();
        let feedback = Feedback::new(page.clone());

        assert_eq!(feedback.locate("PAPER"), page.find_by_node("PAPER", false));
        assert_eq!(feedback.locate(" paper "), page.find_by_node("PAPER", false));
        assert_eq!(feedback.locate("lux"), page.find_by_node("lux", false));
        assert_eq!(feedback.locate("curves"), page.find_by_id("curves"));
        assert!(feedback.locate("LUX").is_none());
        assert!(feedback.locate("").is_none());
    }

    #[tokio::test]
    async fn flash_adds_then_clears() {
        let page = page_with_targets();
        let feedback = Feedback::new(page.clone()).flash_duration(Duration::from_millis(10));
        let el = page.find_by_node("PAPER", false).unwrap();

        assert!(feedback.flash("paper"));
        assert!(page.has_class(el, HIT_CLASS));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!page.has_class(el, HIT_CLASS));
    }

    #[test]
    fn flash_without_runtime() {
        let page = page_with_targets();
        let feedback = Feedback::new(page.clone()).flash_duration(Duration::from_millis(10));
        let el = page.find_by_id("curves").unwrap();

        assert!(feedback.flash("curves"));
        assert!(page.has_class(el, HIT_CLASS));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!page.has_class(el, HIT_CLASS));
    }

    #[test]
    fn flash_missing_target() {
        let feedback = Feedback::new(Page::loaded());
        assert!(!feedback.flash("nowhere"));
    }

    #[test]
    fn detected_toggles() {
        let page = page_with_targets();
        let feedback = Feedback::new(page.clone());
        let el = page.find_by_node("lux", false).unwrap();

        assert!(feedback.set_detected("lux", true));
        assert!(page.has_class(el, DETECTED_CLASS));
        assert!(feedback.set_detected("lux", false));
        assert!(!page.has_class(el, DETECTED_CLASS));
        assert!(!feedback.set_detected("ghost", true));
    }

    #[test]
    fn stubs_fill_gaps_only() {
        let hooks = HookTable::new();
        assert!(hooks.register_if_absent("vault.real", hook(|_| Ok(()))));
        let real = hooks.resolve("vault.real").unwrap();

        let items = normalize_registry(
            &json!([
                { "id": "a", "hook": "vault.paper" },
                { "id": "b", "hook": "window.vault.real" },
                { "id": "c", "hook": "missing.ns.fn" },
                { "id": "d" }
            ]),
            &Schema::default(),
        );
        let feedback = Feedback::new(Page::loaded());

        assert_eq!(ensure_stubs(&items, &hooks, &feedback), 1);
        assert!(hooks.resolve("vault.paper").is_some());
        assert!(std::sync::Arc::ptr_eq(&hooks.resolve("vault.real").unwrap(), &real));
        assert!(hooks.resolve("missing.ns.fn").is_none());

        // A second pass finds the stub already in place.
        assert_eq!(ensure_stubs(&items, &hooks, &feedback), 0);
    }

    #[test]
    fn stub_flashes_item_target() {
        let page = page_with_targets();
        let hooks = HookTable::new();
        let feedback = Feedback::new(page.clone()).flash_duration(Duration::from_secs(5));
        let items = normalize_registry(
            &json!([{ "id": "paper", "name": "Paper", "node": "PAPER", "hook": "vault.paper" }]),
            &Schema::default(),
        );
        ensure_stubs(&items, &hooks, &feedback);

        assert!(hooks.invoke("vault.paper", &Value::Null));
        let el = page.find_by_node("PAPER", false).unwrap();
        assert!(page.has_class(el, HIT_CLASS));
    }

    #[test]
    fn real_action_replaces_stub() {
        let hooks = HookTable::new();
        let items = normalize_registry(
            &json!([{ "id": "a", "hook": "vault.paper" }]),
            &Schema::default(),
        );
        ensure_stubs(&items, &hooks, &Feedback::new(Page::loaded()));
        let slot = hooks.bind("vault.paper").unwrap();
        assert!(slot.is_stub());

        assert!(hooks.register_if_absent("vault.paper", hook(|_| Ok(()))));
        assert!(!slot.is_stub());
    }
}
