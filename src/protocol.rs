//! Room message protocol.
//!
//! Every message is one JSON object `{"type": ..., "roomId": ..., "payload": ...}`.
//! Outgoing messages are typed; incoming ones are parsed leniently and
//! anything malformed or unknown is dropped.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rally::{Participant, RallyDescriptor};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    StateRequest,
    TimeSyncRequest { t0: i64 },
    PlayerAdd(NewPlayer),
    PlayerRemove(String),
    RallyStart(RallyStart),
    RallyEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlayer {
    pub id: String,
    pub name: String,
    pub march_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RallyStart {
    pub starter_id: String,
    pub rally_duration_ms: i64,
    pub pre_delay_ms: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Outgoing<'a> {
    room_id: &'a str,
    #[serde(flatten)]
    message: &'a ClientMessage,
}

impl ClientMessage {
    pub fn encode(&self, room_id: &str) -> serde_json::Result<String> {
        serde_json::to_string(&Outgoing {
            room_id,
            message: self,
        })
    }
}

/// Full authoritative room snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoomState {
    #[serde(default)]
    pub players: Vec<Participant>,
    #[serde(default)]
    pub rally: Option<RallyDescriptor>,
}

/// Echoed request time plus server receive/send times. Fields may be
/// missing or non-numeric on the wire; validation happens in the clock sync.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TimeSyncReply {
    #[serde(default)]
    pub t0: Option<f64>,
    #[serde(default)]
    pub t1: Option<f64>,
    #[serde(default)]
    pub t2: Option<f64>,
}

impl TimeSyncReply {
    /// `(t0, t1, t2)`, with missing fields reported as NaN.
    pub fn timestamps(&self) -> (f64, f64, f64) {
        let v = |x: Option<f64>| x.unwrap_or(f64::NAN);
        (v(self.t0), v(self.t1), v(self.t2))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    State(RoomState),
    TimeSyncResponse(TimeSyncReply),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Parse one incoming text frame. Returns `None` for anything unusable.
pub fn parse_server_message(text: &str) -> Option<ServerMessage> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            debug!("[Net] Dropping malformed message: {}", e);
            return None;
        }
    };

    let parsed = match envelope.kind.as_str() {
        "STATE" => serde_json::from_value(envelope.payload).map(ServerMessage::State),
        "TIME_SYNC_RESPONSE" => {
            serde_json::from_value(envelope.payload).map(ServerMessage::TimeSyncResponse)
        }
        other => {
            debug!("[Net] Ignoring message type {}", other);
            return None;
        }
    };

    match parsed {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("[Net] Dropping {} with bad payload: {}", envelope.kind, e);
            None
        }
    }
}
