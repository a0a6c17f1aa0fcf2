//! Registered-only agent identity and presence
//!
//! An agent joins the bus only if the registry lists it by name. Once
//! admitted it announces itself with `agent:ready`, then repeats
//! `agent:heartbeat` until its connection closes.

use crate::ipc::{self, HostMessage};
use crate::registry::{LoadedRegistry, RegistryError, RegistryItem, RegistryLoader, find_agent};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const READY: &str = "agent:ready";
pub const HEARTBEAT: &str = "agent:heartbeat";

pub const DEFAULT_HEARTBEAT_MS: u64 = 15_000;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("whoami missing")]
    MissingWhoami,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{0:?} is not registered")]
    NotRegistered(String),
}

/// An admitted agent: its own record and the registry that admitted it.
#[derive(Debug, Clone)]
pub struct AgentSelf {
    pub item: RegistryItem,
    pub registry: LoadedRegistry,
}

/// Load the registry and admit `whoami` only if a record carries that name.
pub async fn gate(
    loader: &RegistryLoader,
    candidates: &[String],
    whoami: &str,
) -> Result<AgentSelf, GateError> {
    let whoami = whoami.trim();
    if whoami.is_empty() {
        return Err(GateError::MissingWhoami);
    }
    let registry = loader.load(candidates).await?;
    let item = find_agent(&registry.items, whoami)
        .cloned()
        .ok_or_else(|| GateError::NotRegistered(whoami.to_string()))?;
    info!(id = %item.id, name = %item.name, url = %registry.url, "agent admitted");
    Ok(AgentSelf { item, registry })
}

/// Presence payload for `event`.
pub fn presence(me: &AgentSelf, event: &str) -> Value {
    json!({
        "event": event,
        "name": me.item.name,
        "id": me.item.id,
        "source": me.registry.url,
        "ts": chrono::Utc::now().timestamp_millis(),
    })
}

async fn publish<W>(writer: &mut W, me: &AgentSelf, event: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let message = HostMessage::Emit {
        event: event.to_string(),
        payload: presence(me, event),
    };
    let line = ipc::encode(&message).map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Publish `agent:ready`, then `agent:heartbeat` every `every`. Returns only
/// when a write fails.
pub async fn announce<W>(writer: &mut W, me: &AgentSelf, every: Duration) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    publish(writer, me, READY).await?;
    let mut beats = tokio::time::interval_at(Instant::now() + every, every);
    beats.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        beats.tick().await;
        debug!(id = %me.item.id, "heartbeat");
        publish(writer, me, HEARTBEAT).await?;
    }
}
