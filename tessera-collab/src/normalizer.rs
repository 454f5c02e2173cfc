//! Raw change notification → typed [`ChangeEvent`].
//!
//! Assumes the notification is already scoped to the subscribed project.
//! Returns `None` for malformed notifications and for echoes of the local
//! actor's own writes, so an optimistic update is never applied twice.

use chrono::Utc;
use std::sync::OnceLock;
use std::time::Instant;
use tessera_core::ActorId;

use crate::event::{ChangeEvent, ChangeKind, RawNotification};

/// Normalize `raw` for a client acting as `local_actor`.
pub fn normalize(raw: RawNotification, local_actor: ActorId) -> Option<ChangeEvent> {
    let RawNotification {
        kind,
        new,
        old,
        commit_timestamp,
    } = raw;

    let new_author = new.as_ref().map(|b| b.updated_by);
    let old_author = old.as_ref().map(|b| b.updated_by);
    if is_echo(new_author, old_author, local_actor) {
        log::trace!("Suppressed echo of local {kind} write");
        return None;
    }

    let (block, previous) = match (new, old) {
        (Some(new), old) => (new, old),
        (None, Some(old)) => (old.clone(), Some(old)),
        (None, None) => {
            log::debug!("Dropping {kind} notification without snapshots");
            return None;
        }
    };

    Some(ChangeEvent {
        kind,
        actor_id: block.updated_by,
        timestamp: commit_timestamp.unwrap_or_else(Utc::now),
        operation_id: operation_id(kind),
        block,
        previous,
    })
}

fn is_echo(new_actor: Option<ActorId>, old_actor: Option<ActorId>, local: ActorId) -> bool {
    new_actor == Some(local) || old_actor == Some(local)
}

/// `{kind}-{monotonic micros}-{random}`; unique enough for log correlation.
fn operation_id(kind: ChangeKind) -> String {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let elapsed = EPOCH.get_or_init(Instant::now).elapsed().as_micros();
    format!("{kind}-{elapsed}-{:08x}", rand::random::<u32>())
}
