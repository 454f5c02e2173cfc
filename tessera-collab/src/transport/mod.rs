//! Channel transport abstraction.
//!
//! A transport opens named channels. Each channel carries three kinds of
//! inbound traffic, delivered in order on a single stream:
//!
//! ```text
//!             ┌──────────────── ChannelHandle ───────────────┐
//! store  ───► │ Change(RawNotification)   (filtered by spec)  │
//! peers  ───► │ Presence(PresenceDelta)   sync / join / leave │ ──► take_events()
//! socket ───► │ Status(SubscribeStatus)   mid-session status  │
//!             └───────────────────────────────────────────────┘
//! ```
//!
//! Implementations: [`memory::MemoryTransport`] (in-process hub) and
//! [`ws::WsTransport`] (WebSocket client for [`ChannelRelay`](crate::relay::ChannelRelay)).

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_core::{ActorId, ProjectId};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::event::RawNotification;
use crate::presence::{PresenceDelta, PresenceEntry};

/// Server-side scoping of the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub project_id: ProjectId,
}

impl ChangeFilter {
    pub fn project(project_id: ProjectId) -> Self {
        Self { project_id }
    }

    pub fn matches(&self, raw: &RawNotification) -> bool {
        raw.project_id() == Some(self.project_id)
    }
}

/// Everything a transport needs to open a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    /// Presence entries published on this channel are keyed by this actor.
    pub presence_key: ActorId,
    pub filter: ChangeFilter,
    /// Capacity of the inbound event queue.
    pub event_buffer: usize,
}

/// Outcome of a subscribe attempt, also reported mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl fmt::Display for SubscribeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscribeStatus::Subscribed => "SUBSCRIBED",
            SubscribeStatus::ChannelError => "CHANNEL_ERROR",
            SubscribeStatus::TimedOut => "TIMED_OUT",
            SubscribeStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Inbound traffic on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Change(RawNotification),
    Presence(PresenceDelta),
    Status(SubscribeStatus),
}

/// Opens channels. One transport is shared by every subscription of a
/// channel manager.
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    type Handle: ChannelHandle;

    async fn open_channel(&self, spec: ChannelSpec) -> Result<Self::Handle, TransportError>;
}

/// A single open channel.
///
/// Handles are shared behind an `Arc`; all methods take `&self`.
#[async_trait]
pub trait ChannelHandle: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Take the inbound event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Start receiving traffic. Resolves once the remote side acknowledges.
    async fn subscribe(&self) -> SubscribeStatus;

    /// Publish (or overwrite) this client's presence entry.
    async fn track(&self, entry: &PresenceEntry) -> Result<(), TransportError>;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Release the channel. Idempotent.
    async fn close(&self);
}
