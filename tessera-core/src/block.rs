//! Block data model: the mutable work item collaborators edit.
//!
//! A block belongs to exactly one project and is mutated by any collaborator
//! on that project. The six user-visible fields compared during conflict
//! detection are listed in [`BlockField`].

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a project (one realtime channel per project).
pub type ProjectId = Uuid;

/// Identifier of a block.
pub type BlockId = Uuid;

/// Identifier of a collaborator (the authenticated user behind a write).
pub type ActorId = Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Progress out of range: {0} (expected 0..=100)")]
    InvalidProgress(u8),
}

/// Completion percentage, always within `0..=100`.
///
/// Validated at construction and on deserialization, so a `Block` can
/// never carry an out-of-range value.
#[nutype(
    validate(less_or_equal = 100),
    default = 0,
    derive(
        Debug,
        Default,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Into,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Progress(u8);

impl Progress {
    /// Create a progress value, rejecting anything above 100.
    pub fn new(value: u8) -> Result<Self, BlockError> {
        Progress::try_new(value).map_err(|_| BlockError::InvalidProgress(value))
    }

    /// Create a progress value, saturating at 100.
    pub fn saturating(value: u8) -> Self {
        Self::new(value.min(100)).unwrap_or_default()
    }

    pub fn value(&self) -> u8 {
        self.into_inner()
    }
}

/// Workflow status of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    #[default]
    Backlog,
    Active,
    Blocked,
    Review,
    Done,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Backlog => "backlog",
            BlockStatus::Active => "active",
            BlockStatus::Blocked => "blocked",
            BlockStatus::Review => "review",
            BlockStatus::Done => "done",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// The fields compared when deciding whether two snapshots diverged.
///
/// `id`, `project_id` and `updated_by` are identity/attribution and never
/// count as a divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockField {
    Title,
    Content,
    Status,
    Progress,
    Lane,
    Priority,
}

impl BlockField {
    pub const ALL: [BlockField; 6] = [
        BlockField::Title,
        BlockField::Content,
        BlockField::Status,
        BlockField::Progress,
        BlockField::Lane,
        BlockField::Priority,
    ];
}

/// A work item on a project board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub lane: String,
    #[serde(default)]
    pub status: BlockStatus,
    pub progress: Progress,
    #[serde(default)]
    pub priority: Priority,
    /// Actor that performed the last write to this block.
    pub updated_by: ActorId,
}

impl Block {
    /// Create a fresh block in the `backlog` lane with zero progress.
    pub fn new(project_id: ProjectId, title: impl Into<String>, updated_by: ActorId) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            title: title.into(),
            content: String::new(),
            lane: "backlog".to_string(),
            status: BlockStatus::default(),
            progress: Progress::default(),
            priority: Priority::default(),
            updated_by,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
        self
    }

    pub fn with_status(mut self, status: BlockStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set progress from a raw percentage.
    pub fn set_progress(&mut self, value: u8) -> Result<(), BlockError> {
        self.progress = Progress::new(value)?;
        Ok(())
    }

    /// Fields whose value differs between `self` and `baseline`.
    ///
    /// Returned in [`BlockField::ALL`] order.
    pub fn changed_fields(&self, baseline: &Block) -> Vec<BlockField> {
        BlockField::ALL
            .into_iter()
            .filter(|field| !self.field_eq(baseline, *field))
            .collect()
    }

    /// Whether any compared field differs from `baseline`.
    pub fn diverges_from(&self, baseline: &Block) -> bool {
        BlockField::ALL
            .into_iter()
            .any(|field| !self.field_eq(baseline, field))
    }

    fn field_eq(&self, other: &Block, field: BlockField) -> bool {
        match field {
            BlockField::Title => self.title == other.title,
            BlockField::Content => self.content == other.content,
            BlockField::Status => self.status == other.status,
            BlockField::Progress => self.progress == other.progress,
            BlockField::Lane => self.lane == other.lane,
            BlockField::Priority => self.priority == other.priority,
        }
    }
}
