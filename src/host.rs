//! Host page model
//!
//! Stands in for the document the dispatcher attaches to: an ordered list of
//! key-down listeners, the feedback targets ("elements") agents have mounted,
//! and the parse state the engine waits on before starting.

use crate::hotkey::KeyEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error};

/// Document parse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Initial parse still running
    Loading,
    Interactive,
    Complete,
}

/// A feedback target. Located by `node` (the `data-node` attribute) or `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub classes: BTreeSet<String>,
}

impl Element {
    pub fn with_node(node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            ..Default::default()
        }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }
}

/// Handle to a mounted element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementRef(usize);

/// Key-down listener attached to a page.
pub type KeyListener = Arc<dyn Fn(&mut KeyEvent) + Send + Sync>;

/// Identifies an attached key listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct PageInner {
    listeners: Mutex<Vec<(ListenerId, KeyListener)>>,
    next_listener: AtomicU64,
    elements: Mutex<Vec<Element>>,
    ready: watch::Sender<ReadyState>,
}

/// The host page. Cloning yields another handle to the same page.
#[derive(Clone)]
pub struct Page {
    inner: Arc<PageInner>,
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Page {
    /// A page still in its initial parse.
    pub fn new() -> Self {
        Self::with_state(ReadyState::Loading)
    }

    /// A page that has finished loading.
    pub fn loaded() -> Self {
        Self::with_state(ReadyState::Complete)
    }

    fn with_state(state: ReadyState) -> Self {
        let (ready, _) = watch::channel(state);
        Self {
            inner: Arc::new(PageInner {
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                elements: Mutex::new(Vec::new()),
                ready,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Ready state
    // -----------------------------------------------------------------------

    pub fn ready_state(&self) -> ReadyState {
        *self.inner.ready.borrow()
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        debug!(?state, "page ready state");
        self.inner.ready.send_replace(state);
    }

    /// Resolve once the initial parse has finished (immediately if it has).
    pub async fn parsed(&self) {
        let mut rx = self.inner.ready.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state != ReadyState::Loading).await;
    }

    // -----------------------------------------------------------------------
    // Key listeners
    // -----------------------------------------------------------------------

    pub fn add_key_listener(&self, listener: KeyListener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        guard(&self.inner.listeners).push((id, listener));
        id
    }

    /// Returns `false` if the listener was already gone.
    pub fn remove_key_listener(&self, id: ListenerId) -> bool {
        let mut listeners = guard(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn key_listener_count(&self) -> usize {
        guard(&self.inner.listeners).len()
    }

    /// Deliver a key-down event to every attached listener, in attach order.
    pub fn dispatch_key(&self, event: &mut KeyEvent) {
        let snapshot: Vec<KeyListener> = guard(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(key = %event.key, "key listener panicked");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Elements
    // -----------------------------------------------------------------------

    /// Mount a feedback target. Mounting an element whose `id` is already
    /// present updates that element's `node` instead of adding a duplicate.
    pub fn mount(&self, element: Element) -> ElementRef {
        let mut elements = guard(&self.inner.elements);
        if let Some(id) = &element.id
            && let Some(pos) = elements.iter().position(|e| e.id.as_ref() == Some(id))
        {
            if element.node.is_some() {
                elements[pos].node = element.node;
            }
            return ElementRef(pos);
        }
        elements.push(element);
        ElementRef(elements.len() - 1)
    }

    /// Find an element whose `node` equals `token`, optionally ignoring ASCII case.
    pub fn find_by_node(&self, token: &str, ignore_case: bool) -> Option<ElementRef> {
        guard(&self.inner.elements)
            .iter()
            .position(|e| {
                e.node.as_deref().is_some_and(|node| {
                    if ignore_case {
                        node.eq_ignore_ascii_case(token)
                    } else {
                        node == token
                    }
                })
            })
            .map(ElementRef)
    }

    pub fn find_by_id(&self, id: &str) -> Option<ElementRef> {
        guard(&self.inner.elements)
            .iter()
            .position(|e| e.id.as_deref() == Some(id))
            .map(ElementRef)
    }

    pub fn element(&self, r: ElementRef) -> Option<Element> {
        guard(&self.inner.elements).get(r.0).cloned()
    }

    pub fn elements(&self) -> Vec<Element> {
        guard(&self.inner.elements).clone()
    }

    /// Add or remove `class` on an element.
    pub fn toggle_class(&self, r: ElementRef, class: &str, on: bool) {
        if let Some(element) = guard(&self.inner.elements).get_mut(r.0) {
            if on {
                element.classes.insert(class.to_string());
            } else {
                element.classes.remove(class);
            }
        }
    }

    pub fn has_class(&self, r: ElementRef, class: &str) -> bool {
        guard(&self.inner.elements)
            .get(r.0)
            .is_some_and(|e| e.classes.contains(class))
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("ready", &self.ready_state())
            .field("listeners", &self.key_listener_count())
            .field("elements", &guard(&self.inner.elements).len())
            .finish()
    }
}
