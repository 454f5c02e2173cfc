//! Ledger of local optimistic edits awaiting store acknowledgement.
//!
//! When a remote change arrives for a block with a pending edit, the ledger
//! runs the conflict resolver against the edit's baseline. The edit is
//! retired as soon as it is conflicted, superseded by the server, or settled
//! by the host.

use std::collections::HashMap;
use tessera_core::{detect_conflict, Block, BlockId, ConflictRecord, ProjectId};

use crate::event::{ChangeEvent, ChangeKind};

/// A local edit applied before the store confirmed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    /// Snapshot both sides last agreed on.
    pub baseline: Block,
    /// Local, not yet acknowledged version.
    pub optimistic: Block,
}

#[derive(Debug, Default)]
pub struct OptimisticLedger {
    edits: HashMap<(ProjectId, BlockId), PendingEdit>,
}

impl OptimisticLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the pending edit for `optimistic.id`.
    pub fn record(&mut self, project_id: ProjectId, baseline: Block, optimistic: Block) {
        self.edits.insert(
            (project_id, optimistic.id),
            PendingEdit {
                baseline,
                optimistic,
            },
        );
    }

    pub fn settle(&mut self, project_id: ProjectId, block_id: BlockId) -> Option<PendingEdit> {
        self.edits.remove(&(project_id, block_id))
    }

    pub fn get(&self, project_id: ProjectId, block_id: BlockId) -> Option<&PendingEdit> {
        self.edits.get(&(project_id, block_id))
    }

    /// Reconcile an inbound remote change against any pending edit.
    ///
    /// Returns a conflict record when both sides diverged from the baseline.
    pub fn reconcile(
        &mut self,
        project_id: ProjectId,
        event: &ChangeEvent,
    ) -> Option<ConflictRecord> {
        let key = (project_id, event.block.id);
        let pending = self.edits.get(&key)?;

        if event.kind == ChangeKind::Removed {
            log::debug!("Block {} removed remotely; dropping pending edit", event.block.id);
            self.edits.remove(&key);
            return None;
        }

        let server = &event.block;
        let record = detect_conflict(&pending.optimistic, server, &pending.baseline);
        if record.is_some() || server.diverges_from(&pending.baseline) {
            // Server moved past the baseline; this edit can no longer be matched.
            self.edits.remove(&key);
        }
        record
    }

    pub fn drop_project(&mut self, project_id: ProjectId) {
        self.edits.retain(|(project, _), _| *project != project_id);
    }

    pub fn clear(&mut self) {
        self.edits.clear();
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}
