//! Presence roster: who is attached to a project channel right now.
//!
//! ## Data flow
//!
//! ```text
//! transport presence event
//!       │  Sync (full state) / Join (upsert) / Leave (remove)
//!       ▼
//! PresenceTracker::apply()
//!       │
//!       ▼
//! PresenceRoster (immutable snapshot, Arc-shared)
//!       │
//!       ├──► on_presence callback
//!       └──► EventBus "presence" topic
//! ```
//!
//! Entries are keyed by actor id: one entry per actor per channel. A full sync
//! replaces the roster wholesale; entries are never partially merged across
//! delta kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::{ActorId, BlockId, ProjectId};

/// 2D cursor position in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Identity of the local collaborator, supplied at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalActor {
    pub id: ActorId,
    pub display_name: String,
    /// Contact identity shown next to the avatar.
    pub email: String,
}

impl LocalActor {
    pub fn new(id: ActorId, display_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            email: email.into(),
        }
    }
}

/// One collaborator's presence on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub actor_id: ActorId,
    pub display_name: String,
    pub email: String,
    pub last_seen: DateTime<Utc>,
    pub active_project: ProjectId,
    pub active_block: Option<BlockId>,
    pub cursor: Option<Vec2>,
}

impl PresenceEntry {
    /// Initial presence for `actor` on `project_id`.
    pub fn for_actor(actor: &LocalActor, project_id: ProjectId) -> Self {
        Self {
            actor_id: actor.id,
            display_name: actor.display_name.clone(),
            email: actor.email.clone(),
            last_seen: Utc::now(),
            active_project: project_id,
            active_block: None,
            cursor: None,
        }
    }

    /// Merge a partial update and refresh `last_seen`.
    pub fn apply(&mut self, update: PresenceUpdate) {
        if let Some(name) = update.display_name {
            self.display_name = name;
        }
        if let Some(block) = update.active_block {
            self.active_block = block;
        }
        if let Some(cursor) = update.cursor {
            self.cursor = cursor;
        }
        self.last_seen = Utc::now();
    }
}

/// Partial presence change. `None` leaves the field untouched;
/// `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub display_name: Option<String>,
    pub active_block: Option<Option<BlockId>>,
    pub cursor: Option<Option<Vec2>>,
}

impl PresenceUpdate {
    pub fn display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn focus_block(block_id: BlockId) -> Self {
        Self {
            active_block: Some(Some(block_id)),
            ..Self::default()
        }
    }

    pub fn blur_block() -> Self {
        Self {
            active_block: Some(None),
            ..Self::default()
        }
    }

    pub fn cursor(position: Vec2) -> Self {
        Self {
            cursor: Some(Some(position)),
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, position: Option<Vec2>) -> Self {
        self.cursor = Some(position);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.active_block.is_none() && self.cursor.is_none()
    }
}

/// Presence change delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceDelta {
    /// Full roster; replaces everything known.
    Sync(Vec<PresenceEntry>),
    /// Upsert one or more entries.
    Join(Vec<PresenceEntry>),
    /// Remove one or more actors.
    Leave(Vec<ActorId>),
}

/// Immutable roster snapshot keyed by actor id.
pub type PresenceRoster = Arc<HashMap<ActorId, PresenceEntry>>;

/// Live roster for a single channel.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<ActorId, PresenceEntry>,
    snapshot: PresenceRoster,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a delta and return the resulting roster.
    pub fn apply(&mut self, delta: PresenceDelta) -> PresenceRoster {
        match delta {
            PresenceDelta::Sync(entries) => {
                self.entries = entries
                    .into_iter()
                    .map(|entry| (entry.actor_id, entry))
                    .collect();
            }
            PresenceDelta::Join(entries) => {
                for entry in entries {
                    self.entries.insert(entry.actor_id, entry);
                }
            }
            PresenceDelta::Leave(actor_ids) => {
                for actor_id in &actor_ids {
                    self.entries.remove(actor_id);
                }
            }
        }

        self.snapshot = Arc::new(self.entries.clone());
        self.snapshot.clone()
    }

    /// Current roster snapshot.
    pub fn roster(&self) -> PresenceRoster {
        self.snapshot.clone()
    }

    pub fn get(&self, actor_id: &ActorId) -> Option<&PresenceEntry> {
        self.entries.get(actor_id)
    }

    pub fn contains(&self, actor_id: &ActorId) -> bool {
        self.entries.contains_key(actor_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
