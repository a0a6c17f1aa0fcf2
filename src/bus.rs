//! In-process publish/subscribe bus
//!
//! Independent agents coordinate by subscribing to event names and publishing
//! [`BusEvent`]s. Delivery is synchronous and ordered: exact-name listeners
//! first, then wildcard (`*`) listeners, each group in subscription order.
//! A failing listener (an `Err` return or a panic) is logged and skipped;
//! delivery continues with the rest.
//!
//! The internal lock is never held while a listener runs, so listeners may
//! subscribe, unsubscribe and emit re-entrantly.

use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tracing::{error, trace};

/// Bus protocol version, logged when a namespace brings its bus online.
pub const VERSION: &str = "1.0.0";

/// Wildcard channel: receives every event after exact-name listeners.
pub const ANY: &str = "*";

/// Published once the coordination engine reaches `Ready`.
pub const READY: &str = "vault:ready";

/// Published after every matched hotkey.
pub const HOTKEY: &str = "vault:hotkey";

/// An event travelling over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Registry loaded and dispatcher installed
    Ready { url: String, count: usize },
    /// A hotkey matched and its hook ran (or didn't)
    Hotkey {
        id: String,
        name: String,
        hook: String,
        ok: bool,
    },
    /// Any agent-defined event
    Custom { name: String, payload: Value },
}

#[derive(Deserialize)]
struct ReadyPayload {
    url: String,
    count: usize,
}

#[derive(Deserialize)]
struct HotkeyPayload {
    id: String,
    name: String,
    #[serde(default)]
    hook: String,
    ok: bool,
}

impl BusEvent {
    pub fn custom(name: impl Into<String>, payload: Value) -> Self {
        Self::Custom {
            name: name.into(),
            payload,
        }
    }

    /// Rebuild an event from its wire form.
    ///
    /// Core event names decode into their typed variants when the payload has
    /// the expected shape; everything else stays `Custom`.
    pub fn from_parts(name: impl Into<String>, payload: Value) -> Self {
        let name = name.into();
        match name.as_str() {
            READY => {
                if let Ok(p) = serde_json::from_value::<ReadyPayload>(payload.clone()) {
                    return Self::Ready {
                        url: p.url,
                        count: p.count,
                    };
                }
            }
            HOTKEY => {
                if let Ok(p) = serde_json::from_value::<HotkeyPayload>(payload.clone()) {
                    return Self::Hotkey {
                        id: p.id,
                        name: p.name,
                        hook: p.hook,
                        ok: p.ok,
                    };
                }
            }
            _ => {}
        }
        Self::Custom { name, payload }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ready { .. } => READY,
            Self::Hotkey { .. } => HOTKEY,
            Self::Custom { name, .. } => name,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Ready { url, count } => json!({ "url": url, "count": count }),
            Self::Hotkey { id, name, hook, ok } => {
                json!({ "id": id, "name": name, "hook": hook, "ok": ok })
            }
            Self::Custom { payload, .. } => payload.clone(),
        }
    }
}

type ListenerFn = dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync;

/// A bus listener. Identity is pointer identity: subscribing the same
/// `Listener` twice to one channel registers it once.
pub type Listener = Arc<ListenerFn>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

type Channels = BTreeMap<String, Vec<Listener>>;

/// Publish/subscribe bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Channels>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        lock_channels(&self.inner)
    }

    /// Subscribe `listener` to `event` (use [`ANY`] for every event).
    pub fn on(&self, event: &str, listener: Listener) -> Subscription {
        if event.is_empty() {
            return Subscription::noop();
        }

        {
            let mut channels = self.lock();
            let set = channels.entry(event.to_string()).or_default();
            if !set.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
                set.push(Arc::clone(&listener));
            }
        }

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event: event.to_string(),
            listener: Some(listener),
        }
    }

    /// Subscribe for a single delivery. The wrapper unsubscribes itself before
    /// calling `listener`, so a re-entrant `emit` cannot deliver twice.
    pub fn once(&self, event: &str, listener: Listener) -> Subscription {
        let own: Arc<OnceLock<Weak<ListenerFn>>> = Arc::new(OnceLock::new());
        let fired = AtomicBool::new(false);
        let bus = Arc::downgrade(&self.inner);
        let channel = event.to_string();

        let cell = Arc::clone(&own);
        let wrapper: Listener = Arc::new(move |ev: &BusEvent| {
            if fired.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if let (Some(inner), Some(me)) = (bus.upgrade(), cell.get().and_then(Weak::upgrade)) {
                remove_listener(&inner, &channel, &me);
            }
            listener(ev)
        });
        let _ = own.set(Arc::downgrade(&wrapper));

        self.on(event, wrapper)
    }

    /// Remove `listener` from `event`. Empty channels are dropped.
    pub fn off(&self, event: &str, listener: &Listener) {
        remove_listener(&self.inner, event, listener);
    }

    /// Deliver `event` to exact-name listeners, then wildcard listeners.
    pub fn emit(&self, event: &BusEvent) {
        let name = event.name();
        let (exact, wildcard) = {
            let channels = self.lock();
            let exact = channels.get(name).cloned().unwrap_or_default();
            let wildcard = if name == ANY {
                Vec::new()
            } else {
                channels.get(ANY).cloned().unwrap_or_default()
            };
            (exact, wildcard)
        };

        trace!(event = name, exact = exact.len(), wildcard = wildcard.len(), "emit");
        self.deliver(name, &exact, event);
        self.deliver(ANY, &wildcard, event);
    }

    fn deliver(&self, channel: &str, snapshot: &[Listener], event: &BusEvent) {
        for listener in snapshot {
            // Skip listeners unsubscribed earlier in this same delivery.
            if !self.is_subscribed(channel, listener) {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(event = event.name(), channel, "handler error: {e:#}"),
                Err(_) => error!(event = event.name(), channel, "handler panicked"),
            }
        }
    }

    fn is_subscribed(&self, channel: &str, listener: &Listener) -> bool {
        self.lock()
            .get(channel)
            .is_some_and(|set| set.iter().any(|l| Arc::ptr_eq(l, listener)))
    }

    /// Listener count for one channel, or across all channels.
    pub fn count(&self, event: Option<&str>) -> usize {
        let channels = self.lock();
        match event {
            Some(event) => channels.get(event).map_or(0, Vec::len),
            None => channels.values().map(Vec::len).sum(),
        }
    }

    /// Channel name -> listener count.
    pub fn list(&self) -> BTreeMap<String, usize> {
        self.lock()
            .iter()
            .map(|(name, set)| (name.clone(), set.len()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn same_bus(&self, other: &EventBus) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.list())
            .finish()
    }
}

fn lock_channels(inner: &Mutex<Channels>) -> MutexGuard<'_, Channels> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_listener(inner: &Mutex<Channels>, event: &str, listener: &Listener) {
    let mut channels = lock_channels(inner);
    let Some(set) = channels.get_mut(event) else {
        return;
    };
    set.retain(|existing| !Arc::ptr_eq(existing, listener));
    if set.is_empty() {
        channels.remove(event);
    }
}

/// Handle returned by [`EventBus::on`] / [`EventBus::once`].
///
/// Dropping it leaves the listener subscribed; call
/// [`unsubscribe`](Self::unsubscribe) to remove it. Unsubscribing twice is
/// harmless.
#[derive(Clone)]
pub struct Subscription {
    bus: Weak<Mutex<Channels>>,
    event: String,
    listener: Option<Listener>,
}

impl Subscription {
    fn noop() -> Self {
        Self {
            bus: Weak::new(),
            event: String::new(),
            listener: None,
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(&self) {
        if let (Some(inner), Some(listener)) = (self.bus.upgrade(), &self.listener) {
            remove_listener(&inner, &self.event, listener);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let l = listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, l)
    }

    fn ping() -> BusEvent {
        BusEvent::custom("ping", Value::Null)
    }

    #[test]
    fn duplicate_registration_delivers_once() {
        let bus = EventBus::new();
        let (hits, l) = counter();
        bus.on("ping", Arc::clone(&l));
        bus.on("ping", l);
        assert_eq!(bus.count(Some("ping")), 1);

        bus.emit(&ping());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_delivers_exactly_once() {
        let bus = EventBus::new();
        let (hits, l) = counter();
        bus.once("ping", l);

        bus.emit(&ping());
        bus.emit(&ping());
        bus.emit(&ping());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.count(Some("ping")), 0);
    }

    #[test]
    fn once_survives_reentrant_emit() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let inner_bus = bus.clone();
        bus.once(
            "ping",
            listener(move |ev| {
                h.fetch_add(1, Ordering::SeqCst);
                inner_bus.emit(ev);
                Ok(())
            }),
        );

        bus.emit(&ping());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handlers_do_not_stop_delivery() {
        let bus = EventBus::new();
        bus.on("ping", listener(|_| anyhow::bail!("boom")));
        bus.on("ping", listener(|_| panic!("kaboom")));
        let (hits, l) = counter();
        bus.on("ping", l);

        bus.emit(&ping());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exact_listeners_run_before_wildcard() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        bus.on(
            ANY,
            listener(move |ev| {
                o.lock().unwrap().push(format!("any:{}", ev.name()));
                Ok(())
            }),
        );
        let o = Arc::clone(&order);
        bus.on(
            "ping",
            listener(move |_| {
                o.lock().unwrap().push("first".to_string());
                Ok(())
            }),
        );
        let o = Arc::clone(&order);
        bus.on(
            "ping",
            listener(move |_| {
                o.lock().unwrap().push("second".to_string());
                Ok(())
            }),
        );

        bus.emit(&ping());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first", "second", "any:ping"]
        );
    }

    #[test]
    fn listener_removed_mid_delivery_is_skipped() {
        let bus = EventBus::new();
        let (hits, victim) = counter();

        let b = bus.clone();
        let v = Arc::clone(&victim);
        bus.on(
            "ping",
            listener(move |_| {
                b.off("ping", &v);
                Ok(())
            }),
        );
        bus.on("ping", victim);

        bus.emit(&ping());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let (hits, l) = counter();
        let sub = bus.on("ping", l);
        sub.unsubscribe();
        sub.unsubscribe();

        bus.emit(&ping());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(bus.list().is_empty());
    }

    #[test]
    fn empty_event_name_is_ignored() {
        let bus = EventBus::new();
        let (_, l) = counter();
        let sub = bus.on("", l);
        assert_eq!(bus.count(None), 0);
        sub.unsubscribe();
    }

    #[test]
    fn count_and_list() {
        let bus = EventBus::new();
        let (_, a) = counter();
        let (_, b) = counter();
        let (_, c) = counter();
        bus.on("ping", a);
        bus.on("ping", b);
        bus.on(ANY, c);

        assert_eq!(bus.count(Some("ping")), 2);
        assert_eq!(bus.count(Some("pong")), 0);
        assert_eq!(bus.count(None), 3);

        let list = bus.list();
        assert_eq!(list.get("ping"), Some(&2));
        assert_eq!(list.get(ANY), Some(&1));
    }

    #[test]
    fn off_drops_empty_channel() {
        let bus = EventBus::new();
        let (_, l) = counter();
        bus.on("ping", Arc::clone(&l));
        bus.off("ping", &l);
        assert!(!bus.list().contains_key("ping"));
        // unknown channel is a no-op
        bus.off("nope", &l);
    }

    #[test]
    fn wildcard_emit_delivers_once() {
        let bus = EventBus::new();
        let (hits, l) = counter();
        bus.on(ANY, l);
        bus.emit(&BusEvent::custom(ANY, Value::Null));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn core_events_decode_from_wire() {
        let ready = BusEvent::from_parts(READY, json!({ "url": "./registry.json", "count": 3 }));
        assert_eq!(
            ready,
            BusEvent::Ready {
                url: "./registry.json".into(),
                count: 3
            }
        );

        let hotkey = BusEvent::Hotkey {
            id: "alpha".into(),
            name: "Alpha".into(),
            hook: "vault.alpha".into(),
            ok: true,
        };
        assert_eq!(BusEvent::from_parts(HOTKEY, hotkey.payload()), hotkey);

        // malformed core payloads stay custom
        let odd = BusEvent::from_parts(READY, json!("soon"));
        assert!(matches!(odd, BusEvent::Custom { .. }));
        assert_eq!(odd.name(), READY);
    }
}
