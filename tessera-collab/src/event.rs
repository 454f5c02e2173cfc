//! Event types flowing through the realtime layer.
//!
//! - [`RawNotification`]: what the transport's change feed delivers
//! - [`ChangeEvent`]: the normalized, actor-attributed form handed to hosts
//! - [`BusEvent`]: the tagged union mirrored onto the [`EventBus`](crate::event_bus::EventBus)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_core::{ActorId, Block, ConflictRecord, ProjectId};

use crate::presence::PresenceRoster;

/// Kind of row change reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "INSERT")]
    Inserted,
    #[serde(rename = "UPDATE")]
    Updated,
    #[serde(rename = "DELETE")]
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Inserted => "inserted",
            ChangeKind::Updated => "updated",
            ChangeKind::Removed => "removed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification as delivered by the transport, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNotification {
    pub kind: ChangeKind,
    /// Row after the change (inserts, updates).
    pub new: Option<Block>,
    /// Row before the change (updates, deletes).
    pub old: Option<Block>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RawNotification {
    pub fn inserted(block: Block) -> Self {
        Self {
            kind: ChangeKind::Inserted,
            new: Some(block),
            old: None,
            commit_timestamp: Some(Utc::now()),
        }
    }

    pub fn updated(old: Block, new: Block) -> Self {
        Self {
            kind: ChangeKind::Updated,
            new: Some(new),
            old: Some(old),
            commit_timestamp: Some(Utc::now()),
        }
    }

    pub fn removed(old: Block) -> Self {
        Self {
            kind: ChangeKind::Removed,
            new: None,
            old: Some(old),
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// Project the notification belongs to, if either snapshot is present.
    pub fn project_id(&self) -> Option<ProjectId> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|block| block.project_id)
    }
}

/// A normalized change to one block, attributed to a remote actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Resulting snapshot; for removals, the last known snapshot.
    pub block: Block,
    /// Snapshot before the change, when the transport supplied one.
    pub previous: Option<Block>,
    pub actor_id: ActorId,
    pub timestamp: DateTime<Utc>,
    /// Locally generated id for log correlation. Carries no ordering.
    pub operation_id: String,
}

/// Connection status of the channel manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Event bus topic names.
pub mod topics {
    pub const CONNECTION: &str = "connection";
    pub const BLOCK_CHANGE: &str = "block_change";
    pub const PRESENCE: &str = "presence";
    pub const CONFLICT: &str = "conflict";
}

/// Everything the channel manager mirrors onto the event bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Connection(ConnectionStatus),
    BlockChange {
        project_id: ProjectId,
        event: ChangeEvent,
    },
    Presence {
        project_id: ProjectId,
        roster: PresenceRoster,
    },
    Conflict {
        project_id: ProjectId,
        record: ConflictRecord,
    },
}

impl BusEvent {
    /// Topic this event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            BusEvent::Connection(_) => topics::CONNECTION,
            BusEvent::BlockChange { .. } => topics::BLOCK_CHANGE,
            BusEvent::Presence { .. } => topics::PRESENCE,
            BusEvent::Conflict { .. } => topics::CONFLICT,
        }
    }
}
