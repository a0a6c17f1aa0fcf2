//! IPC protocol between host clients and the daemon
//!
//! Newline-delimited JSON over a Unix socket. Clients send [`HostMessage`]s;
//! a connection that subscribes or registers a hook receives [`WireEvent`]
//! lines back. Hook invocations arrive as [`INVOKED`] events.

use crate::bus::{ANY, BusEvent};
use crate::host::Element;
use crate::hotkey::KeyEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;

/// Socket name for IPC communication
pub const SOCKET_NAME: &str = "sigil.sock";

/// Event name of the line written back when a registered hook is called.
/// The payload is `{ "hook", "payload" }`.
pub const INVOKED: &str = "hook:invoked";

/// Get the socket path for IPC communication
///
/// Uses XDG_RUNTIME_DIR if available, falls back to the temp dir
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    runtime_dir.join(SOCKET_NAME)
}

/// Message from a host client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Key-down event to dispatch on the page
    Key(KeyEvent),
    /// Publish on the bus
    Emit {
        event: String,
        #[serde(default)]
        payload: Value,
    },
    /// Stream bus events for `event` back on this connection
    Subscribe {
        #[serde(default = "any_event")]
        event: String,
    },
    /// Declare a feedback target
    Mount(Element),
    /// Provide the action at `hook` for as long as this connection stays open
    Register { hook: String },
    /// Mark or unmark the feedback target for `token` as detected
    Detect {
        token: String,
        #[serde(default = "enabled")]
        on: bool,
    },
}

fn any_event() -> String {
    ANY.to_string()
}

fn enabled() -> bool {
    true
}

/// A bus event as streamed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl From<&BusEvent> for WireEvent {
    fn from(event: &BusEvent) -> Self {
        Self {
            event: event.name().to_string(),
            payload: event.payload(),
        }
    }
}

impl From<WireEvent> for BusEvent {
    fn from(wire: WireEvent) -> Self {
        BusEvent::from_parts(wire.event, wire.payload)
    }
}

/// Encode a message as one protocol line, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Connect and send `messages`, then close the connection.
pub async fn send(path: &Path, messages: &[HostMessage]) -> std::io::Result<()> {
    let mut stream = UnixStream::connect(path).await?;
    for message in messages {
        let line = encode(message).map_err(std::io::Error::other)?;
        stream.write_all(line.as_bytes()).await?;
    }
    stream.shutdown().await
}

/// Connect, send `message` and keep the connection open for replies.
async fn open(path: &Path, message: &HostMessage) -> std::io::Result<Lines<BufReader<UnixStream>>> {
    let mut stream = UnixStream::connect(path).await?;
    let line = encode(message).map_err(std::io::Error::other)?;
    stream.write_all(line.as_bytes()).await?;
    Ok(BufReader::new(stream).lines())
}

/// Connect and subscribe to `event`; returns the stream of event lines.
pub async fn subscribe(path: &Path, event: &str) -> std::io::Result<Lines<BufReader<UnixStream>>> {
    open(
        path,
        &HostMessage::Subscribe {
            event: event.to_string(),
        },
    )
    .await
}

/// Connect and provide the action at `hook`; returns the stream of
/// [`INVOKED`] lines. Dropping the stream withdraws the action.
pub async fn register(path: &Path, hook: &str) -> std::io::Result<Lines<BufReader<UnixStream>>> {
    open(
        path,
        &HostMessage::Register {
            hook: hook.to_string(),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotkey::KeyTarget;
    use serde_json::json;

    #[test]
    fn socket_path_ends_with_socket_name() {
        assert!(socket_path().ends_with(SOCKET_NAME));
    }

    #[test]
    fn key_message_is_flat() {
        let msg: HostMessage =
            serde_json::from_str(r#"{"type":"key","key":"p","alt":true}"#).unwrap();
        assert_eq!(msg, HostMessage::Key(KeyEvent::new("p").alt()));

        let json = serde_json::to_value(HostMessage::Key(
            KeyEvent::new("a").ctrl().on(KeyTarget::element("input")),
        ))
        .unwrap();
        assert_eq!(json["type"], "key");
        assert_eq!(json["key"], "a");
        assert_eq!(json["ctrl"], true);
    }

    #[test]
    fn host_messages_parse() {
        let messages = [
            (
                r#"{"type":"emit","event":"paper:ready","payload":{"n":1}}"#,
                HostMessage::Emit {
                    event: "paper:ready".into(),
                    payload: json!({ "n": 1 }),
                },
            ),
            (
                r#"{"type":"emit","event":"ping"}"#,
                HostMessage::Emit {
                    event: "ping".into(),
                    payload: Value::Null,
                },
            ),
            (
                r#"{"type":"subscribe"}"#,
                HostMessage::Subscribe { event: "*".into() },
            ),
            (
                r#"{"type":"mount","node":"PAPER"}"#,
                HostMessage::Mount(Element::with_node("PAPER")),
            ),
            (
                r#"{"type":"register","hook":"vault.paper"}"#,
                HostMessage::Register {
                    hook: "vault.paper".into(),
                },
            ),
            (
                r#"{"type":"detect","token":"lux"}"#,
                HostMessage::Detect {
                    token: "lux".into(),
                    on: true,
                },
            ),
            (
                r#"{"type":"detect","token":"lux","on":false}"#,
                HostMessage::Detect {
                    token: "lux".into(),
                    on: false,
                },
            ),
        ];
        for (line, expected) in messages {
            assert_eq!(serde_json::from_str::<HostMessage>(line).unwrap(), expected);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<HostMessage>(r#"{"type":"reload"}"#).is_err());
        assert!(serde_json::from_str::<HostMessage>("not json").is_err());
    }

    #[test]
    fn wire_event_keeps_core_events_typed() {
        let ready = BusEvent::Ready {
            url: "https://vault.test/registry.json".into(),
            count: 3,
        };
        let wire = WireEvent::from(&ready);
        assert_eq!(wire.event, "vault:ready");
        assert_eq!(BusEvent::from(wire), ready);

        let line = encode(&WireEvent::from(&BusEvent::custom("x", json!([1])))).unwrap();
        assert_eq!(line, "{\"event\":\"x\",\"payload\":[1]}\n");
    }
}
