//! Hook capability table
//!
//! Actions are registered under dotted paths (`vault.paper`). A path may
//! carry an optional `window.` root qualifier, which is stripped.
//! Every path maps to a shared [`HookSlot`]; the dispatcher binds each
//! registry item to its slot once at load time, and a real action registered
//! later (replacing a stub) is visible through the same slot.
//!
//! Writers only fill gaps: [`HookTable::register_if_absent`] never replaces a
//! real action, and stubs never replace anything callable.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Namespace that always exists.
pub const ROOT: &str = "vault";

const ROOT_QUALIFIER: &str = "window.";

type HookFn = dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync;

/// A callable action. Receives the dispatch payload (`{ "item", "event" }`).
pub type Hook = Arc<HookFn>;

/// Wrap a closure as a [`Hook`].
pub fn hook<F>(f: F) -> Hook
where
    F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

enum SlotValue {
    /// Bound by the dispatcher but nothing registered yet
    Vacant,
    /// A registered non-callable value
    Value(Value),
    /// Placeholder installed by the stub layer
    Stub(Hook),
    Action(Hook),
}

/// The value living at one dotted path.
pub struct HookSlot {
    path: String,
    value: RwLock<SlotValue>,
}

impl HookSlot {
    fn new(path: String, value: SlotValue) -> Self {
        Self {
            path,
            value: RwLock::new(value),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SlotValue> {
        self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SlotValue> {
        self.value.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The callable currently held (real action or stub).
    pub fn callable(&self) -> Option<Hook> {
        match &*self.read() {
            SlotValue::Action(hook) | SlotValue::Stub(hook) => Some(Arc::clone(hook)),
            SlotValue::Vacant | SlotValue::Value(_) => None,
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(&*self.read(), SlotValue::Stub(_))
    }

    /// Call the held action with `payload`.
    ///
    /// Returns `false` without calling anything when the slot holds no
    /// callable. An `Err` or a panic from the action is logged with the path
    /// and also yields `false`.
    pub fn invoke(&self, payload: &Value) -> bool {
        let Some(hook) = self.callable() else {
            return false;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| hook(payload))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(path = %self.path, "hook threw: {e:#}");
                false
            }
            Err(_) => {
                warn!(path = %self.path, "hook panicked");
                false
            }
        }
    }
}

impl std::fmt::Debug for HookSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.read() {
            SlotValue::Vacant => "vacant",
            SlotValue::Value(_) => "value",
            SlotValue::Stub(_) => "stub",
            SlotValue::Action(_) => "action",
        };
        f.debug_struct("HookSlot")
            .field("path", &self.path)
            .field("kind", &kind)
            .finish()
    }
}

#[derive(Default)]
struct Table {
    slots: HashMap<String, Arc<HookSlot>>,
    namespaces: HashSet<String>,
}

impl Table {
    fn slot(&mut self, path: &str) -> Arc<HookSlot> {
        Arc::clone(
            self.slots
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(HookSlot::new(path.to_string(), SlotValue::Vacant))),
        )
    }

    fn add_namespaces(&mut self, path: &str) {
        let mut prefix = String::new();
        for segment in path.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            self.namespaces.insert(prefix.clone());
        }
    }

    /// The global root always exists; otherwise the parent must be known.
    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('.') {
            Some((parent, _)) => self.namespaces.contains(parent),
            None => true,
        }
    }
}

/// Shared capability table. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct HookTable {
    inner: Arc<RwLock<Table>>,
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HookTable {
    pub fn new() -> Self {
        let mut table = Table::default();
        table.namespaces.insert(ROOT.to_string());
        Self {
            inner: Arc::new(RwLock::new(table)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Canonical form of a hook path: trimmed, `window.` stripped, empty
    /// segments dropped. `None` when nothing is left.
    pub fn canonical(path: &str) -> Option<String> {
        let trimmed = path.trim();
        let trimmed = trimmed.strip_prefix(ROOT_QUALIFIER).unwrap_or(trimmed);
        let joined = trimmed
            .split('.')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join(".");
        (!joined.is_empty()).then_some(joined)
    }

    /// Look up the callable at `path`. Never panics.
    pub fn resolve(&self, path: &str) -> Option<Hook> {
        let path = Self::canonical(path)?;
        self.read().slots.get(&path)?.callable()
    }

    /// Resolve and call `path`, see [`HookSlot::invoke`].
    pub fn invoke(&self, path: &str, payload: &Value) -> bool {
        let Some(path) = Self::canonical(path) else {
            return false;
        };
        let slot = self.read().slots.get(&path).cloned();
        match slot {
            Some(slot) => slot.invoke(payload),
            None => {
                debug!(%path, "hook not found");
                false
            }
        }
    }

    /// Bind `path` to its slot, reserving a vacant slot if nothing is
    /// registered yet.
    pub fn bind(&self, path: &str) -> Option<Arc<HookSlot>> {
        let path = Self::canonical(path)?;
        if let Some(slot) = self.read().slots.get(&path) {
            return Some(Arc::clone(slot));
        }
        Some(self.write().slot(&path))
    }

    /// Register a real action unless one is already present.
    ///
    /// Vacant slots and stubs count as absent. Parent namespaces are created.
    pub fn register_if_absent(&self, path: &str, hook: Hook) -> bool {
        let Some(path) = Self::canonical(path) else {
            return false;
        };
        let mut table = self.write();
        if let Some((parent, _)) = path.rsplit_once('.') {
            table.add_namespaces(parent);
        }
        let slot = table.slot(&path);
        drop(table);

        let mut value = slot.write();
        match &*value {
            SlotValue::Vacant | SlotValue::Stub(_) => {
                *value = SlotValue::Action(hook);
                debug!(%path, "hook registered");
                true
            }
            SlotValue::Value(_) | SlotValue::Action(_) => {
                debug!(%path, "hook already present, keeping existing");
                false
            }
        }
    }

    /// Withdraw `hook` from `path` if it is still the registered action. The
    /// slot goes back to vacant; bound dispatchers then report no hook.
    pub fn unregister(&self, path: &str, hook: &Hook) -> bool {
        let Some(path) = Self::canonical(path) else {
            return false;
        };
        let Some(slot) = self.read().slots.get(&path).cloned() else {
            return false;
        };
        let mut value = slot.write();
        match &*value {
            SlotValue::Action(current) if Arc::ptr_eq(current, hook) => {
                *value = SlotValue::Vacant;
                debug!(%path, "hook unregistered");
                true
            }
            _ => false,
        }
    }

    /// Store a non-callable value at `path` if the slot is vacant.
    pub fn set_value_if_absent(&self, path: &str, value: Value) -> bool {
        let Some(path) = Self::canonical(path) else {
            return false;
        };
        let slot = self.write().slot(&path);
        let mut current = slot.write();
        if matches!(&*current, SlotValue::Vacant) {
            *current = SlotValue::Value(value);
            true
        } else {
            false
        }
    }

    /// Install a placeholder at `path` when its parent namespace exists and
    /// nothing callable is there yet.
    pub fn install_stub(&self, path: &str, stub: Hook) -> bool {
        let Some(path) = Self::canonical(path) else {
            return false;
        };
        let mut table = self.write();
        if !table.parent_exists(&path) {
            debug!(%path, "no parent namespace, skipping stub");
            return false;
        }
        let slot = table.slot(&path);
        drop(table);

        let mut value = slot.write();
        match &*value {
            SlotValue::Vacant | SlotValue::Value(_) => {
                *value = SlotValue::Stub(stub);
                true
            }
            SlotValue::Stub(_) | SlotValue::Action(_) => false,
        }
    }

    /// Declare a namespace (and its prefixes).
    pub fn ensure_namespace(&self, path: &str) {
        if let Some(path) = Self::canonical(path) {
            self.write().add_namespaces(&path);
        }
    }

    pub fn has_namespace(&self, path: &str) -> bool {
        Self::canonical(path).is_some_and(|path| self.read().namespaces.contains(&path))
    }

    /// Paths holding something callable, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .read()
            .slots
            .values()
            .filter(|slot| slot.callable().is_some())
            .map(|slot| slot.path.clone())
            .collect();
        paths.sort();
        paths
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable")
            .field("paths", &self.paths())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hook() -> (Arc<AtomicUsize>, Hook) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let f = hook(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, f)
    }

    #[test]
    fn unregister_only_removes_own_action() {
        let table = HookTable::new();
        let (_, mine) = counting_hook();
        let (_, other) = counting_hook();
        let slot = table.bind("vault.echo").unwrap();

        assert!(table.register_if_absent("window.vault.echo", Arc::clone(&mine)));
        assert!(!table.unregister("vault.echo", &other));
        assert!(slot.callable().is_some());

        assert!(table.unregister("vault.echo", &mine));
        assert!(slot.callable().is_none());
        assert!(!slot.invoke(&json!(null)));
        assert!(!table.unregister("vault.echo", &mine));
        assert!(!table.unregister("vault.absent", &mine));

        // The path is free for the next agent.
        assert!(table.register_if_absent("vault.echo", other));
    }

    #[test]
    fn canonical_paths() {
        assert_eq!(HookTable::canonical("vault.paper").as_deref(), Some("vault.paper"));
        assert_eq!(
            HookTable::canonical(" window.vault.paper ").as_deref(),
            Some("vault.paper")
        );
        assert_eq!(HookTable::canonical("vault..paper.").as_deref(), Some("vault.paper"));
        assert_eq!(HookTable::canonical(""), None);
        assert_eq!(HookTable::canonical("window."), None);
    }

    #[test]
    fn resolve_missing_segments_is_none() {
        let table = HookTable::new();
        assert!(table.resolve("ns.doThing").is_none());
        assert!(table.resolve("vault").is_none());
        assert!(table.resolve("").is_none());
    }

    #[test]
    fn invoke_registered_hook() {
        let table = HookTable::new();
        let (hits, h) = counting_hook();
        assert!(table.register_if_absent("vault.paper", h));

        assert!(table.invoke("window.vault.paper", &json!({})));
        assert!(table.invoke("vault.paper", &json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invoke_unresolvable_or_non_callable_is_false() {
        let table = HookTable::new();
        assert!(!table.invoke("ns.missing", &Value::Null));
        assert!(!table.invoke("", &Value::Null));

        assert!(table.set_value_if_absent("vault.version", json!("1.0")));
        assert!(table.resolve("vault.version").is_none());
        assert!(!table.invoke("vault.version", &Value::Null));
    }

    #[test]
    fn invoke_contains_errors_and_panics() {
        let table = HookTable::new();
        table.register_if_absent("vault.err", hook(|_| anyhow::bail!("nope")));
        table.register_if_absent("vault.panic", hook(|_| panic!("boom")));

        assert!(!table.invoke("vault.err", &Value::Null));
        assert!(!table.invoke("vault.panic", &Value::Null));
    }

    #[test]
    fn register_never_clobbers_action() {
        let table = HookTable::new();
        let (first, a) = counting_hook();
        let (second, b) = counting_hook();
        assert!(table.register_if_absent("vault.x", a));
        assert!(!table.register_if_absent("vault.x", b));

        table.invoke("vault.x", &Value::Null);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stub_requires_parent_namespace() {
        let table = HookTable::new();
        let (_, s) = counting_hook();
        assert!(!table.install_stub("ns.doThing", Arc::clone(&s)));
        assert!(table.install_stub("vault.doThing", Arc::clone(&s)));
        // top-level paths live on the global root
        assert!(table.install_stub("standalone", s));
    }

    #[test]
    fn stub_never_overwrites_callable() {
        let table = HookTable::new();
        let (real_hits, real) = counting_hook();
        let (stub_hits, stub) = counting_hook();
        table.register_if_absent("vault.paper", real);
        assert!(!table.install_stub("vault.paper", stub));

        table.invoke("vault.paper", &Value::Null);
        assert_eq!(real_hits.load(Ordering::SeqCst), 1);
        assert_eq!(stub_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stub_replaces_plain_value() {
        let table = HookTable::new();
        table.set_value_if_absent("vault.paper", json!(42));
        let (hits, stub) = counting_hook();
        assert!(table.install_stub("vault.paper", stub));
        assert!(table.invoke("vault.paper", &Value::Null));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bound_slot_sees_later_registration() {
        let table = HookTable::new();
        let (stub_hits, stub) = counting_hook();
        table.install_stub("vault.paper", stub);
        let slot = table.bind("vault.paper").unwrap();
        assert!(slot.is_stub());

        let (real_hits, real) = counting_hook();
        assert!(table.register_if_absent("vault.paper", real));
        assert!(!slot.is_stub());

        assert!(slot.invoke(&Value::Null));
        assert_eq!(real_hits.load(Ordering::SeqCst), 1);
        assert_eq!(stub_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn vacant_binding_fills_in_later() {
        let table = HookTable::new();
        let slot = table.bind("ns.doThing").unwrap();
        assert!(!slot.invoke(&Value::Null));
        assert!(table.resolve("ns.doThing").is_none());

        let (hits, h) = counting_hook();
        table.register_if_absent("ns.doThing", h);
        assert!(table.has_namespace("ns"));
        assert!(slot.invoke(&Value::Null));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn namespaces_include_prefixes() {
        let table = HookTable::new();
        assert!(table.has_namespace("vault"));
        table.ensure_namespace("window.agents.lux");
        assert!(table.has_namespace("agents"));
        assert!(table.has_namespace("agents.lux"));
        assert!(!table.has_namespace("agents.sol"));
    }

    #[test]
    fn paths_lists_callables_only() {
        let table = HookTable::new();
        let (_, a) = counting_hook();
        table.register_if_absent("vault.b", a);
        let (_, s) = counting_hook();
        table.install_stub("vault.a", s);
        table.bind("vault.c");
        table.set_value_if_absent("vault.d", json!(true));
        assert_eq!(table.paths(), vec!["vault.a", "vault.b"]);
    }
}
