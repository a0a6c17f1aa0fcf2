//! Unix socket server bridging host clients onto the namespace
//!
//! Listens on [`ipc::socket_path`] for newline-delimited [`HostMessage`]s.
//! Key events are dispatched on the page, `emit` publishes on the bus, and a
//! subscribing connection gets matching bus events written back to it. A
//! connection that registers a hook receives its invocations the same way;
//! its subscriptions and hooks are withdrawn when it closes.

use crate::bus::{Subscription, listener};
use crate::feedback::Feedback;
use crate::hooks::{Hook, hook};
use crate::ipc::{self, HostMessage, WireEvent};
use crate::namespace::Namespace;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Lines queued per connection before further events are dropped.
pub const CONNECTION_QUEUE: usize = 256;

/// Start the Unix socket server on the default path.
pub async fn start(ns: Arc<Namespace>) {
    let path = ipc::socket_path();
    match bind(&path) {
        Ok(listener) => serve(listener, ns).await,
        Err(e) => warn!("Failed to bind Unix socket {}: {}", path.display(), e),
    }
}

/// Bind `path`, replacing a stale socket file.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("IPC server listening on {}", path.display());
    Ok(listener)
}

/// Accept connections forever.
pub async fn serve(listener: UnixListener, ns: Arc<Namespace>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::spawn(handle_connection(stream, Arc::clone(&ns)));
            }
            Err(e) => {
                warn!("Failed to accept socket connection: {}", e);
            }
        }
    }
}

/// What one connection has attached to the namespace.
struct Connection {
    tx: mpsc::Sender<WireEvent>,
    subscriptions: Vec<Subscription>,
    hooks: Vec<(String, Hook)>,
}

impl Connection {
    fn close(self, ns: &Namespace) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        for (path, hook) in &self.hooks {
            ns.hooks().unregister(path, hook);
        }
    }
}

/// Queue `event` for the connection without waiting. Returns `false` when
/// the queue is full or the connection is gone.
fn forward(tx: &mpsc::Sender<WireEvent>, event: WireEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            debug!(event = %event.event, "connection queue full, dropping event");
            false
        }
        // The connection is shutting down.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn handle_connection(stream: UnixStream, ns: Arc<Namespace>) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<WireEvent>(CONNECTION_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = match ipc::encode(&event) {
                Ok(line) => line,
                Err(e) => {
                    debug!("Failed to encode bus event: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.write_all(line.as_bytes()).await {
                debug!("Subscriber went away: {}", e);
                break;
            }
        }
    });

    let mut conn = Connection {
        tx,
        subscriptions: Vec::new(),
        hooks: Vec::new(),
    };
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HostMessage>(&line) {
            Ok(message) => {
                debug!(?message, "ipc message");
                apply(&ns, message, &mut conn);
            }
            Err(e) => {
                trace!("Failed to parse IPC message: {} (line: {})", e, line);
            }
        }
    }

    conn.close(&ns);
    let _ = writer.await;
}

fn apply(ns: &Namespace, message: HostMessage, conn: &mut Connection) {
    match message {
        HostMessage::Key(mut event) => {
            ns.page().dispatch_key(&mut event);
        }
        HostMessage::Emit { event, payload } => {
            ns.bus().emit(&WireEvent { event, payload }.into());
        }
        HostMessage::Subscribe { event } => {
            let tx = conn.tx.clone();
            let subscription = ns.bus().on(
                &event,
                listener(move |ev| {
                    forward(&tx, WireEvent::from(ev));
                    Ok(())
                }),
            );
            conn.subscriptions.push(subscription);
        }
        HostMessage::Mount(element) => {
            ns.page().mount(element);
        }
        HostMessage::Register { hook: path } => {
            let tx = conn.tx.clone();
            let target = path.clone();
            let action = hook(move |payload| {
                let invoked = WireEvent {
                    event: ipc::INVOKED.to_string(),
                    payload: json!({ "hook": target, "payload": payload }),
                };
                if forward(&tx, invoked) {
                    Ok(())
                } else {
                    anyhow::bail!("hook provider is not reading")
                }
            });
            if ns.hooks().register_if_absent(&path, Arc::clone(&action)) {
                info!(hook = %path, "hook provided over IPC");
                conn.hooks.push((path, action));
            } else {
                info!(hook = %path, "hook already provided, ignoring");
            }
        }
        HostMessage::Detect { token, on } => {
            if !Feedback::new(ns.page().clone()).set_detected(&token, on) {
                debug!(%token, "no feedback target to mark");
            }
        }
    }
}
