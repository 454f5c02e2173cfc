//! Deterministic merge of two divergent block versions.
//!
//! ```text
//!              last_known (baseline)
//!               /                \
//!     optimistic (local)     server (remote)
//!               \                /
//!                 resolve(..)
//!                     │
//!                     ▼
//!          server snapshot, progress = max(local, remote)
//! ```
//!
//! The server wins every textual and enumerated field. Progress is the only
//! field merged with `max`, which is monotonic and commutative, so a larger
//! completion value is never lost whichever side observes the conflict first.
//!
//! Everything here is pure: no I/O, no shared state.

use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockField, BlockId, ProjectId};

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: Block,
    pub has_conflict: bool,
}

/// Both divergent snapshots, the baseline they diverged from, and the merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub optimistic: Block,
    pub server: Block,
    pub baseline: Block,
    pub resolved: Block,
}

impl ConflictRecord {
    pub fn block_id(&self) -> BlockId {
        self.server.id
    }

    pub fn project_id(&self) -> ProjectId {
        self.server.project_id
    }

    /// Fields the local actor changed relative to the baseline.
    pub fn local_fields(&self) -> Vec<BlockField> {
        self.optimistic.changed_fields(&self.baseline)
    }

    /// Fields the server changed relative to the baseline.
    pub fn remote_fields(&self) -> Vec<BlockField> {
        self.server.changed_fields(&self.baseline)
    }

    /// Whether the merge kept a local value the server did not have.
    pub fn kept_local_progress(&self) -> bool {
        self.resolved.progress != self.server.progress
    }
}

/// Merge `optimistic` and `server` against their common `last_known` snapshot.
///
/// A conflict exists only when both sides diverged from the baseline. Without
/// one, the server snapshot is already authoritative and is returned as is.
pub fn resolve(optimistic: &Block, server: &Block, last_known: &Block) -> Resolution {
    let optimistic_changed = optimistic.diverges_from(last_known);
    let server_changed = server.diverges_from(last_known);
    let has_conflict = optimistic_changed && server_changed;

    if !has_conflict {
        return Resolution {
            resolved: server.clone(),
            has_conflict,
        };
    }

    let mut resolved = server.clone();
    resolved.progress = optimistic.progress.max(server.progress);

    log::debug!(
        "Conflict on block {}: local {:?} vs remote {:?}, progress {} -> {}",
        server.id,
        optimistic.changed_fields(last_known),
        server.changed_fields(last_known),
        server.progress,
        resolved.progress,
    );

    Resolution {
        resolved,
        has_conflict,
    }
}

/// Run [`resolve`] and package a [`ConflictRecord`] when the sides collide.
pub fn detect_conflict(
    optimistic: &Block,
    server: &Block,
    baseline: &Block,
) -> Option<ConflictRecord> {
    let resolution = resolve(optimistic, server, baseline);
    if !resolution.has_conflict {
        return None;
    }
    Some(ConflictRecord {
        optimistic: optimistic.clone(),
        server: server.clone(),
        baseline: baseline.clone(),
        resolved: resolution.resolved,
    })
}
