//! WebSocket channel relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── Channel "project:…" ── presence map
//!            ├── ChannelRelay ─────┤        └── broadcast (presence deltas)
//! Client B ──┘        │            └── Channel "project:…" …
//!                     │
//!                     └── change feed (broadcast, filtered per connection)
//! ```
//!
//! Each channel keeps the authoritative presence map: a joining client gets a
//! full sync, `Track` upserts and fans out a join, disconnect or `Leave`
//! removes the entry and fans out a leave. Published changes are forwarded to
//! every joined connection whose filter matches, never back to the publisher.

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tessera_core::{ActorId, ProjectId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{ProtocolError, TransportError};
use crate::event::RawNotification;
use crate::presence::{PresenceDelta, PresenceEntry};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::transport::ChangeFilter;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum joined connections per channel
    pub max_members_per_channel: usize,
    /// Broadcast capacity of each channel and of the change feed
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_channel: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub changes_published: u64,
    pub joins_rejected: u64,
    pub active_channels: usize,
}

/// Pre-encoded server frame plus the routing data needed to filter it.
#[derive(Debug)]
struct Envelope {
    /// Connection that caused the frame.
    origin: Uuid,
    /// Set for changes; connections only receive their own project's.
    project_id: Option<ProjectId>,
    bytes: Vec<u8>,
}

impl Envelope {
    fn encode(
        origin: Uuid,
        project_id: Option<ProjectId>,
        frame: &ServerFrame,
    ) -> Result<Arc<Self>, ProtocolError> {
        Ok(Arc::new(Self {
            origin,
            project_id,
            bytes: frame.encode()?,
        }))
    }
}

struct RelayChannel {
    members: HashSet<Uuid>,
    presence: HashMap<ActorId, PresenceEntry>,
    sender: broadcast::Sender<Arc<Envelope>>,
}

impl RelayChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            members: HashSet::new(),
            presence: HashMap::new(),
            sender,
        }
    }

    fn fan_out(&self, origin: Uuid, delta: PresenceDelta) {
        match Envelope::encode(origin, None, &ServerFrame::Presence(delta)) {
            Ok(envelope) => {
                let _ = self.sender.send(envelope);
            }
            Err(e) => log::error!("Failed to encode presence frame: {e}"),
        }
    }
}

/// A connection's membership in one channel.
struct Session {
    channel: String,
    presence_key: ActorId,
    filter: ChangeFilter,
}

struct RelayShared {
    config: RelayConfig,
    channels: RwLock<HashMap<String, RelayChannel>>,
    changes: broadcast::Sender<Arc<Envelope>>,
    stats: RwLock<RelayStats>,
}

impl RelayShared {
    async fn join(
        &self,
        conn_id: Uuid,
        channel: &str,
    ) -> Result<(Vec<PresenceEntry>, broadcast::Receiver<Arc<Envelope>>), String> {
        let mut channels = self.channels.write().await;
        let max = self.config.max_members_per_channel;
        if channels.get(channel).map_or(0, |c| c.members.len()) >= max {
            self.stats.write().await.joins_rejected += 1;
            return Err(format!("channel '{channel}' is full ({max} members)"));
        }

        let room = channels
            .entry(channel.to_string())
            .or_insert_with(|| RelayChannel::new(self.config.broadcast_capacity));
        room.members.insert(conn_id);
        let roster = room.presence.values().cloned().collect();
        let rx = room.sender.subscribe();

        self.stats.write().await.active_channels = channels.len();
        Ok((roster, rx))
    }

    async fn track(&self, conn_id: Uuid, session: &Session, entry: PresenceEntry) {
        let mut channels = self.channels.write().await;
        if let Some(room) = channels.get_mut(&session.channel) {
            room.presence.insert(session.presence_key, entry.clone());
            room.fan_out(conn_id, PresenceDelta::Join(vec![entry]));
        }
    }

    async fn leave(&self, conn_id: Uuid, session: &Session) {
        let mut channels = self.channels.write().await;
        if let Some(room) = channels.get_mut(&session.channel) {
            room.members.remove(&conn_id);
            if room.presence.remove(&session.presence_key).is_some() {
                room.fan_out(conn_id, PresenceDelta::Leave(vec![session.presence_key]));
            }
            if room.members.is_empty() {
                channels.remove(&session.channel);
                log::info!("Channel '{}' removed (empty)", session.channel);
            }
        }
        self.stats.write().await.active_channels = channels.len();
    }

    async fn publish(&self, conn_id: Uuid, raw: RawNotification) -> Result<usize, ProtocolError> {
        let project_id = raw.project_id();
        let envelope = Envelope::encode(conn_id, project_id, &ServerFrame::Change(raw))?;
        let receivers = self.changes.send(envelope).unwrap_or(0);
        self.stats.write().await.changes_published += 1;
        Ok(receivers)
    }
}

/// The channel relay.
pub struct ChannelRelay {
    shared: Arc<RelayShared>,
}

impl ChannelRelay {
    pub fn new(config: RelayConfig) -> Self {
        let (changes, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            shared: Arc::new(RelayShared {
                config,
                channels: RwLock::new(HashMap::new()),
                changes,
                stats: RwLock::new(RelayStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Channel relay listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<RelayShared>,
    ) -> Result<(), TransportError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = Uuid::new_v4();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let mut presence_rx: Option<broadcast::Receiver<Arc<Envelope>>> = None;
        let mut changes_rx: Option<broadcast::Receiver<Arc<Envelope>>> = None;

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        let bytes: Vec<u8> = match msg {
                            Some(Ok(Message::Binary(data))) => data.into(),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => return Err(e.into()),
                        };
                        {
                            let mut s = shared.stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        let frame = match ClientFrame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Undecodable frame from {addr}: {e}");
                                continue;
                            }
                        };

                        match frame {
                            ClientFrame::Join { channel, presence_key, filter } => {
                                if session.is_some() {
                                    let reply = ServerFrame::JoinRejected {
                                        reason: "already joined".to_string(),
                                    };
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    continue;
                                }
                                match shared.join(conn_id, &channel).await {
                                    Ok((roster, rx)) => {
                                        log::info!("{presence_key} joined '{channel}' ({} present)", roster.len());
                                        presence_rx = Some(rx);
                                        changes_rx = Some(shared.changes.subscribe());
                                        let reply = ServerFrame::Joined { channel: channel.clone(), roster };
                                        session = Some(Session { channel, presence_key, filter });
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                    Err(reason) => {
                                        log::warn!("Rejected join of {presence_key} to '{channel}': {reason}");
                                        let reply = ServerFrame::JoinRejected { reason };
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }
                            }
                            ClientFrame::Track(entry) => match &session {
                                Some(s) => shared.track(conn_id, s, entry).await,
                                None => log::warn!("Track before join from {addr}"),
                            },
                            ClientFrame::Publish(raw) => {
                                let receivers = shared.publish(conn_id, raw).await?;
                                log::trace!("Change from {addr} offered to {receivers} connections");
                            }
                            ClientFrame::Ping { nonce } => {
                                let reply = ServerFrame::Pong { nonce };
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                            ClientFrame::Leave => break,
                        }
                    }

                    // Presence deltas for the joined channel (own deltas included)
                    envelope = recv_from(&mut presence_rx) => match envelope {
                        Ok(envelope) => {
                            ws_sender.send(Message::Binary(envelope.bytes.clone().into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => log::warn!("Connection {addr} lagged by {n} presence frames"),
                        Err(RecvError::Closed) => break,
                    },

                    // Change feed, scoped by the session filter
                    envelope = recv_from(&mut changes_rx) => match envelope {
                        Ok(envelope) => {
                            let wanted = session
                                .as_ref()
                                .is_some_and(|s| envelope.project_id == Some(s.filter.project_id));
                            if wanted && envelope.origin != conn_id {
                                ws_sender.send(Message::Binary(envelope.bytes.clone().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => log::warn!("Connection {addr} lagged by {n} changes"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            Ok::<(), TransportError>(())
        }
        .await;

        // Cleanup: release presence and membership
        if let Some(s) = &session {
            shared.leave(conn_id, s).await;
            log::info!("{} left '{}'", s.presence_key, s.channel);
        }
        shared.stats.write().await.active_connections -= 1;

        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub async fn channel_count(&self) -> usize {
        self.shared.channels.read().await.len()
    }

    /// Actors with tracked presence on `channel`.
    pub async fn members(&self, channel: &str) -> Vec<ActorId> {
        self.shared
            .channels
            .read()
            .await
            .get(channel)
            .map_or_else(Vec::new, |c| c.presence.keys().copied().collect())
    }
}

async fn recv_from(
    rx: &mut Option<broadcast::Receiver<Arc<Envelope>>>,
) -> Result<Arc<Envelope>, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        // Not joined yet: wait forever
        None => std::future::pending().await,
    }
}
