//! In-process channel transport.
//!
//! A hub of named channels, each with an authoritative presence map and a
//! tokio broadcast group, plus one hub-wide change feed standing in for the
//! durable store. Every handle gets a forwarder task that merges the change
//! feed (filtered by the handle's [`ChangeFilter`]) with its channel's
//! presence and status signals into one ordered event stream.
//!
//! Faults can be injected to exercise failure paths: rejected opens, rejected
//! subscribes, unreachable pings, and an unscoped change feed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_core::ActorId;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{ChannelHandle, ChannelSpec, ChannelTransport, SubscribeStatus, TransportEvent};
use crate::error::TransportError;
use crate::event::RawNotification;
use crate::presence::{PresenceDelta, PresenceEntry};

#[derive(Debug, Clone)]
enum ChannelSignal {
    Presence(PresenceDelta),
    Status(SubscribeStatus),
}

struct MemoryChannel {
    presence: Mutex<HashMap<ActorId, PresenceEntry>>,
    sender: broadcast::Sender<ChannelSignal>,
    /// Open handles; the channel is dropped from the hub when this hits zero.
    handles: AtomicUsize,
}

impl MemoryChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            presence: Mutex::new(HashMap::new()),
            sender,
            handles: AtomicUsize::new(0),
        }
    }

    fn signal(&self, signal: ChannelSignal) -> usize {
        self.sender.send(signal).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    reject_open: bool,
    reject_subscribe: bool,
    unreachable: bool,
    unscoped: bool,
}

struct Hub {
    channels: Mutex<HashMap<String, Arc<MemoryChannel>>>,
    changes: broadcast::Sender<RawNotification>,
    faults: Mutex<Faults>,
    capacity: usize,
    opened: AtomicU64,
}

/// In-process [`ChannelTransport`]. Clones share the same hub.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// `capacity` bounds the change feed and each channel's broadcast group.
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            hub: Arc::new(Hub {
                channels: Mutex::new(HashMap::new()),
                changes,
                faults: Mutex::new(Faults::default()),
                capacity: capacity.max(1),
                opened: AtomicU64::new(0),
            }),
        }
    }

    /// Push a notification onto the change feed. Returns the number of
    /// subscribed handles that saw it (before filtering).
    pub fn publish_change(&self, raw: RawNotification) -> usize {
        self.hub.changes.send(raw).unwrap_or(0)
    }

    /// Report a mid-session status to every subscriber of `channel`.
    pub fn emit_status(&self, channel: &str, status: SubscribeStatus) -> usize {
        let channel = self.hub.channels.lock().get(channel).cloned();
        channel.map_or(0, |c| c.signal(ChannelSignal::Status(status)))
    }

    pub fn set_reject_open(&self, on: bool) {
        self.hub.faults.lock().reject_open = on;
    }

    pub fn set_reject_subscribe(&self, on: bool) {
        self.hub.faults.lock().reject_subscribe = on;
    }

    /// Make `track` and `ping` fail on every handle.
    pub fn set_unreachable(&self, on: bool) {
        self.hub.faults.lock().unreachable = on;
    }

    /// Deliver every change to every handle, ignoring filters.
    pub fn set_unscoped(&self, on: bool) {
        self.hub.faults.lock().unscoped = on;
    }

    /// Channels with at least one open handle.
    pub fn channel_count(&self) -> usize {
        self.hub.channels.lock().len()
    }

    pub fn open_handles(&self) -> usize {
        self.hub
            .channels
            .lock()
            .values()
            .map(|c| c.handles.load(Ordering::SeqCst))
            .sum()
    }

    /// Handles opened over the transport's lifetime.
    pub fn total_opened(&self) -> u64 {
        self.hub.opened.load(Ordering::Relaxed)
    }

    /// Actors currently tracked on `channel`.
    pub fn members(&self, channel: &str) -> Vec<ActorId> {
        let channel = self.hub.channels.lock().get(channel).cloned();
        channel.map_or_else(Vec::new, |c| c.presence.lock().keys().copied().collect())
    }

    fn faults(&self) -> Faults {
        *self.hub.faults.lock()
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    type Handle = MemoryChannelHandle;

    async fn open_channel(&self, spec: ChannelSpec) -> Result<MemoryChannelHandle, TransportError> {
        if self.faults().reject_open {
            return Err(TransportError::Open {
                channel: spec.name,
                reason: "rejected by transport".to_string(),
            });
        }

        let channel = {
            let mut channels = self.hub.channels.lock();
            let channel = channels
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(MemoryChannel::new(self.hub.capacity)))
                .clone();
            channel.handles.fetch_add(1, Ordering::SeqCst);
            channel
        };
        self.hub.opened.fetch_add(1, Ordering::Relaxed);
        log::debug!("Opened memory channel '{}' for {}", spec.name, spec.presence_key);

        let (events_tx, events_rx) = mpsc::channel(spec.event_buffer.max(1));
        Ok(MemoryChannelHandle {
            spec,
            hub: self.hub.clone(),
            channel,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            forwarder: Mutex::new(None),
            tracked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// Handle returned by [`MemoryTransport`]. Dropping it releases the channel.
pub struct MemoryChannelHandle {
    spec: ChannelSpec,
    hub: Arc<Hub>,
    channel: Arc<MemoryChannel>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    tracked: AtomicBool,
    closed: AtomicBool,
}

impl MemoryChannelHandle {
    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.hub.faults.lock().unreachable {
            return Err(TransportError::Unreachable);
        }
        Ok(())
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }

        let key = self.spec.presence_key;
        if self.tracked.load(Ordering::SeqCst)
            && self.channel.presence.lock().remove(&key).is_some()
        {
            self.channel
                .signal(ChannelSignal::Presence(PresenceDelta::Leave(vec![key])));
        }

        let mut channels = self.hub.channels.lock();
        if self.channel.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            channels.remove(&self.spec.name);
        }
        log::debug!("Released memory channel '{}' for {key}", self.spec.name);
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannelHandle {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn subscribe(&self) -> SubscribeStatus {
        if self.closed.load(Ordering::SeqCst) {
            return SubscribeStatus::Closed;
        }
        if self.hub.faults.lock().reject_subscribe {
            return SubscribeStatus::ChannelError;
        }

        let mut forwarder = self.forwarder.lock();
        if forwarder.is_some() {
            return SubscribeStatus::Subscribed;
        }

        // Receivers are created before the snapshot so no later delta is missed.
        let mut signals = self.channel.sender.subscribe();
        let mut changes = self.hub.changes.subscribe();
        let sync = PresenceDelta::Sync(self.channel.presence.lock().values().cloned().collect());

        let events = self.events_tx.clone();
        let hub = self.hub.clone();
        let filter = self.spec.filter;
        let name = self.spec.name.clone();

        *forwarder = Some(tokio::spawn(async move {
            if events.send(TransportEvent::Presence(sync)).await.is_err() {
                return;
            }
            loop {
                let event = tokio::select! {
                    change = changes.recv() => match change {
                        Ok(raw) => {
                            if !hub.faults.lock().unscoped && !filter.matches(&raw) {
                                continue;
                            }
                            TransportEvent::Change(raw)
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Channel '{name}' lagged by {n} changes");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    signal = signals.recv() => match signal {
                        Ok(ChannelSignal::Presence(delta)) => TransportEvent::Presence(delta),
                        Ok(ChannelSignal::Status(status)) => TransportEvent::Status(status),
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Channel '{name}' lagged by {n} presence signals");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }));

        SubscribeStatus::Subscribed
    }

    async fn track(&self, entry: &PresenceEntry) -> Result<(), TransportError> {
        self.ensure_live()?;
        self.channel
            .presence
            .lock()
            .insert(self.spec.presence_key, entry.clone());
        self.tracked.store(true, Ordering::SeqCst);
        self.channel
            .signal(ChannelSignal::Presence(PresenceDelta::Join(vec![entry.clone()])));
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.ensure_live()
    }

    async fn close(&self) {
        self.release();
    }
}

impl Drop for MemoryChannelHandle {
    fn drop(&mut self) {
        self.release();
    }
}
