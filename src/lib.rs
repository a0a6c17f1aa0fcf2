//! sigil: hotkey registry and coordination bus
//!
//! Loads a JSON registry of keyboard shortcuts, dispatches matching key
//! events to named hooks, and gives independent agents on the same page a
//! shared publish/subscribe bus.

pub mod agent;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod feedback;
pub mod hooks;
pub mod host;
pub mod hotkey;
pub mod ipc;
pub mod namespace;
pub mod registry;
pub mod server;

pub use bus::{BusEvent, EventBus};
pub use engine::{Engine, EngineState};
pub use namespace::Namespace;
