//! WebSocket transport to the room server.
//!
//! The socket is split into a reader task that turns text frames into
//! [`SessionEvent::Message`]s and a writer task fed by a channel, so the
//! session itself never awaits network I/O.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::session::SessionEvent;
use crate::traits::Transport;

/// Build the room endpoint from a server base URL (`ws://host:port`).
pub fn room_url(server: &str, room_id: &str) -> Result<String> {
    let server = server.trim_end_matches('/');
    if !(server.starts_with("ws://") || server.starts_with("wss://")) {
        bail!("Server URL must start with ws:// or wss:// (got {})", server);
    }
    if room_id.is_empty() || !room_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        bail!("Invalid room id {:?}", room_id);
    }
    Ok(format!("{}/ws?instance_id={}", server, room_id))
}

/// Outgoing messages queued for the writer task.
pub struct ChannelTransport {
    tx: UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn new(tx: UnboundedSender<String>) -> Self {
        ChannelTransport { tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, text: String) -> Result<()> {
        self.tx.send(text).map_err(|_| anyhow!("connection closed"))
    }
}

pub struct Connection {
    pub transport: ChannelTransport,
    pub reader: JoinHandle<()>,
    /// Finishes once the transport is dropped and the queue is flushed.
    pub writer: JoinHandle<()>,
}

/// Connect and start the reader/writer tasks. Incoming frames go to `events`.
pub async fn connect(url: &str, events: UnboundedSender<SessionEvent>) -> Result<Connection> {
    let (ws, _response) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    info!("[Net] Connected to {}", url);

    let (mut sink, mut stream) = ws.split();
    let (out_tx, out_rx): (UnboundedSender<String>, UnboundedReceiver<String>) = mpsc::unbounded_channel();

    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if events.send(SessionEvent::Message(text.to_string())).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("[Net] Receive error: {}", e);
                    break;
                }
            }
        }
        let _ = events.send(SessionEvent::Disconnected);
    });

    let writer = tokio::spawn(async move {
        let mut out_rx = out_rx;
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                warn!("[Net] Send error: {}", e);
                break;
            }
        }
        if let Err(e) = sink.close().await {
            debug!("[Net] Close error: {}", e);
        }
    });

    Ok(Connection {
        transport: ChannelTransport::new(out_tx),
        reader,
        writer,
    })
}
