//! # tessera-core: Block model and conflict resolution for Tessera
//!
//! Pure data types shared by every Tessera crate. Nothing in here performs
//! I/O or holds shared state, so it is safe to use from any thread or task.
//!
//! ## Modules
//!
//! - [`block`]: `Block`, validated `Progress`, status and priority enums
//! - [`conflict`]: `resolve` / `detect_conflict` and `ConflictRecord`

pub mod block;
pub mod conflict;

pub use block::{
    ActorId, Block, BlockError, BlockField, BlockId, BlockStatus, Priority, Progress, ProjectId,
};
pub use conflict::{detect_conflict, resolve, ConflictRecord, Resolution};
