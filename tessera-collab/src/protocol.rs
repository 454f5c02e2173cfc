//! Binary wire protocol between [`WsTransport`](crate::transport::ws::WsTransport)
//! clients and the [`ChannelRelay`](crate::relay::ChannelRelay).
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded frame:
//!
//! ```text
//! client                                 relay
//!   │ ── Join { channel, key, filter } ──► │
//!   │ ◄── Joined { roster } ────────────── │   or JoinRejected { reason }
//!   │ ── Track(entry) ───────────────────► │ ──► Presence(Join) to channel
//!   │ ── Publish(raw) ───────────────────► │ ──► Change(raw) to matching peers
//!   │ ── Ping { nonce } ─────────────────► │
//!   │ ◄── Pong { nonce } ───────────────── │
//!   │ ── Leave ──────────────────────────► │ ──► Presence(Leave) to channel
//! ```

use serde::{Deserialize, Serialize};
use tessera_core::ActorId;

use crate::error::ProtocolError;
use crate::event::RawNotification;
use crate::presence::{PresenceDelta, PresenceEntry};
use crate::transport::ChangeFilter;

/// Frames sent by a channel client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// First frame on every connection.
    Join {
        channel: String,
        presence_key: ActorId,
        filter: ChangeFilter,
    },
    Track(PresenceEntry),
    /// Inject a change notification into the relay's change feed.
    Publish(RawNotification),
    Ping {
        nonce: u64,
    },
    Leave,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Join accepted; carries the full roster of the channel.
    Joined {
        channel: String,
        roster: Vec<PresenceEntry>,
    },
    JoinRejected {
        reason: String,
    },
    Change(RawNotification),
    Presence(PresenceDelta),
    Pong {
        nonce: u64,
    },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Join { .. } => "Join",
            ClientFrame::Track(_) => "Track",
            ClientFrame::Publish(_) => "Publish",
            ClientFrame::Ping { .. } => "Ping",
            ClientFrame::Leave => "Leave",
        }
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerFrame::Joined { .. } => "Joined",
            ServerFrame::JoinRejected { .. } => "JoinRejected",
            ServerFrame::Change(_) => "Change",
            ServerFrame::Presence(_) => "Presence",
            ServerFrame::Pong { .. } => "Pong",
        }
    }
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(frame)
}
