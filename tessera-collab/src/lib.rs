//! # tessera-collab: Realtime collaboration layer for Tessera
//!
//! One channel per project: presence of the collaborators looking at it, a
//! normalized stream of block changes made by others, and conflict reports for
//! local edits the store overtook.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ChannelTransport   ┌──────────────────┐
//! │ ChannelManager   │ ◄──────────────────► │ MemoryTransport  │  (in-process)
//! │ (per host)       │                      │ WsTransport ─────┼──► ChannelRelay
//! └──────┬───────────┘                      └──────────────────┘
//!        │ event pump (per channel)
//!        ├──► normalizer      echo suppression, typed ChangeEvent
//!        ├──► PresenceTracker sync / join / leave → PresenceRoster
//!        ├──► OptimisticLedger → tessera_core::resolve → ConflictRecord
//!        ▼
//! ┌──────────────────┐
//! │ host callbacks   │ on_change / on_presence / on_conflict
//! │ EventBus         │ connection / block_change / presence / conflict
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`manager`]: `ChannelManager`, subscription lifecycle, health probe
//! - [`transport`]: transport trait plus in-memory and WebSocket implementations
//! - [`relay`]: WebSocket relay server backing `WsTransport`
//! - [`protocol`]: bincode wire frames
//! - [`presence`]: presence entries and the roster tracker
//! - [`normalizer`]: raw notification → `ChangeEvent`
//! - [`pending`]: optimistic edit ledger
//! - [`event_bus`]: topic-based publish/subscribe
//! - [`event`], [`config`], [`error`]

pub mod config;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod manager;
pub mod normalizer;
pub mod pending;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod transport;

// Re-exports for convenience
pub use config::RealtimeConfig;
pub use error::{ConfigError, ProtocolError, RealtimeError, TransportError};
pub use event::{topics, BusEvent, ChangeEvent, ChangeKind, ConnectionStatus, RawNotification};
pub use event_bus::{BusSubscription, EventBus};
pub use manager::{ChannelManager, SubscriptionCallbacks, SubscriptionHandle};
pub use normalizer::normalize;
pub use pending::{OptimisticLedger, PendingEdit};
pub use presence::{
    LocalActor, PresenceDelta, PresenceEntry, PresenceRoster, PresenceTracker, PresenceUpdate,
    Vec2,
};
pub use protocol::{ClientFrame, ServerFrame};
pub use relay::{ChannelRelay, RelayConfig, RelayStats};
pub use transport::memory::{MemoryChannelHandle, MemoryTransport};
pub use transport::ws::{WsChannelHandle, WsTransport};
pub use transport::{
    ChangeFilter, ChannelHandle, ChannelSpec, ChannelTransport, SubscribeStatus, TransportEvent,
};
