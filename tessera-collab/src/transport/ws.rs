//! WebSocket channel transport.
//!
//! Opens one socket per channel to a [`ChannelRelay`](crate::relay::ChannelRelay).
//! Each socket gets two background tasks:
//!
//! - writer: drains an mpsc queue of encoded [`ClientFrame`]s into the socket
//! - reader: decodes [`ServerFrame`]s, resolves join/ping acknowledgements and
//!   forwards changes and presence deltas as [`TransportEvent`]s
//!
//! Socket loss is reported as `Status(ChannelError)` on the event stream.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{ChannelHandle, ChannelSpec, ChannelTransport, SubscribeStatus, TransportEvent};
use crate::error::TransportError;
use crate::event::RawNotification;
use crate::presence::{PresenceDelta, PresenceEntry};
use crate::protocol::{ClientFrame, ServerFrame};

type JoinAck = oneshot::Sender<Result<(), String>>;

/// WebSocket [`ChannelTransport`] speaking the relay's bincode protocol.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// `url` is the relay endpoint, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChannelTransport for WsTransport {
    type Handle = WsChannelHandle;

    async fn open_channel(&self, spec: ChannelSpec) -> Result<WsChannelHandle, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Open {
                channel: spec.name.clone(),
                reason: e.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::debug!("Connected to relay {} for channel '{}'", self.url, spec.name);

        // Writer task: forward outgoing queue to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(spec.event_buffer.max(1));
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let shared = Arc::new(Shared::default());
        let (events_tx, events_rx) = mpsc::channel(spec.event_buffer.max(1));

        // Reader task: map server frames to transport events
        let reader = {
            let shared = shared.clone();
            let channel = spec.name.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            let frame = match ServerFrame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Undecodable frame on '{channel}': {e}");
                                    continue;
                                }
                            };
                            if let Some(event) = shared.route(frame) {
                                if events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }

                shared.fail_pending();
                if !shared.closed.load(Ordering::SeqCst) {
                    log::warn!("Relay connection lost for channel '{channel}'");
                    let _ = events_tx
                        .send(TransportEvent::Status(SubscribeStatus::ChannelError))
                        .await;
                }
            })
        };

        Ok(WsChannelHandle {
            spec,
            shared,
            outgoing: Mutex::new(Some(out_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            reader: Mutex::new(Some(reader)),
            next_nonce: AtomicU64::new(1),
        })
    }
}

/// State shared between a handle and its reader task.
#[derive(Default)]
struct Shared {
    join_ack: Mutex<Option<JoinAck>>,
    pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    joined: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    /// Resolve acknowledgements; returns the event to forward, if any.
    fn route(&self, frame: ServerFrame) -> Option<TransportEvent> {
        match frame {
            ServerFrame::Joined { roster, .. } => {
                self.joined.store(true, Ordering::SeqCst);
                if let Some(ack) = self.join_ack.lock().take() {
                    let _ = ack.send(Ok(()));
                }
                Some(TransportEvent::Presence(PresenceDelta::Sync(roster)))
            }
            ServerFrame::JoinRejected { reason } => {
                if let Some(ack) = self.join_ack.lock().take() {
                    let _ = ack.send(Err(reason));
                }
                None
            }
            ServerFrame::Change(raw) => Some(TransportEvent::Change(raw)),
            ServerFrame::Presence(delta) => Some(TransportEvent::Presence(delta)),
            ServerFrame::Pong { nonce } => {
                if let Some(waiter) = self.pings.lock().remove(&nonce) {
                    let _ = waiter.send(());
                }
                None
            }
        }
    }

    fn fail_pending(&self) {
        if let Some(ack) = self.join_ack.lock().take() {
            let _ = ack.send(Err("connection lost".to_string()));
        }
        // Dropping the senders wakes every waiting ping with an error.
        self.pings.lock().clear();
    }
}

/// Handle returned by [`WsTransport`].
pub struct WsChannelHandle {
    spec: ChannelSpec,
    shared: Arc<Shared>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_nonce: AtomicU64,
}

impl WsChannelHandle {
    async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let encoded = frame.encode()?;
        let tx = self.outgoing.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(encoded).await.map_err(|_| TransportError::Closed)
    }

    /// Inject a change notification into the relay's change feed.
    pub async fn publish(&self, raw: RawNotification) -> Result<(), TransportError> {
        self.send(&ClientFrame::Publish(raw)).await
    }

    pub fn is_joined(&self) -> bool {
        self.shared.joined.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.outgoing.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.fail_pending();
    }
}

#[async_trait]
impl ChannelHandle for WsChannelHandle {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn subscribe(&self) -> SubscribeStatus {
        if self.shared.closed.load(Ordering::SeqCst) {
            return SubscribeStatus::Closed;
        }
        if self.is_joined() {
            return SubscribeStatus::Subscribed;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        *self.shared.join_ack.lock() = Some(ack_tx);

        let join = ClientFrame::Join {
            channel: self.spec.name.clone(),
            presence_key: self.spec.presence_key,
            filter: self.spec.filter,
        };
        if let Err(e) = self.send(&join).await {
            log::warn!("Failed to send join for '{}': {e}", self.spec.name);
            return SubscribeStatus::ChannelError;
        }

        match ack_rx.await {
            Ok(Ok(())) => SubscribeStatus::Subscribed,
            Ok(Err(reason)) => {
                log::warn!("Join rejected for '{}': {reason}", self.spec.name);
                SubscribeStatus::ChannelError
            }
            Err(_) => SubscribeStatus::ChannelError,
        }
    }

    async fn track(&self, entry: &PresenceEntry) -> Result<(), TransportError> {
        if !self.is_joined() {
            return Err(TransportError::Subscribe("channel not joined".to_string()));
        }
        self.send(&ClientFrame::Track(entry.clone())).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pings.lock().insert(nonce, tx);

        if let Err(e) = self.send(&ClientFrame::Ping { nonce }).await {
            self.shared.pings.lock().remove(&nonce);
            return Err(e);
        }
        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_joined() {
            let _ = self.send(&ClientFrame::Leave).await;
        }
        self.shutdown();
        log::debug!("Closed relay channel '{}'", self.spec.name);
    }
}

impl Drop for WsChannelHandle {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shutdown();
    }
}
