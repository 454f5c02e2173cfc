//! Per-project channel lifecycle.
//!
//! ## Flow
//!
//! ```text
//! subscribe(project, actor, callbacks)
//!   │  unsubscribe(project)             replace any previous subscription
//!   │  status → Connecting
//!   │  transport.open_channel(spec)     bounded by subscribe_timeout
//!   │  handle.subscribe()               bounded by subscribe_timeout
//!   │  spawn event pump                 one task per channel, in order
//!   │  handle.track(local presence)
//!   ▼  status → Connected | Error
//!
//! event pump:  Change   → scope check → normalize → ledger → on_change / on_conflict
//!              Presence → PresenceTracker → on_presence
//!              Status   → connection status (Closed only disconnects the last live channel)
//!              (every delivery is mirrored on the EventBus)
//! ```
//!
//! All maps live in one [`ManagerState`] behind a single mutex. The lock is
//! never held across an `.await` or while a host callback runs, so callbacks
//! may re-enter the manager. Each subscription carries a generation number;
//! pumps and handles from a replaced subscription are inert.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tessera_core::{ActorId, Block, BlockId, ConflictRecord, ProjectId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, TransportError};
use crate::event::{topics, BusEvent, ChangeEvent, ConnectionStatus};
use crate::event_bus::{invoke_isolated, EventBus};
use crate::normalizer::normalize;
use crate::pending::OptimisticLedger;
use crate::presence::{LocalActor, PresenceEntry, PresenceRoster, PresenceTracker, PresenceUpdate};
use crate::transport::{
    ChangeFilter, ChannelHandle, ChannelSpec, ChannelTransport, SubscribeStatus, TransportEvent,
};

type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
type PresenceCallback = Arc<dyn Fn(&PresenceRoster) + Send + Sync>;
type ConflictCallback = Arc<dyn Fn(&ConflictRecord) + Send + Sync>;

/// Host callbacks for one project subscription. Every callback is optional.
#[derive(Clone, Default)]
pub struct SubscriptionCallbacks {
    on_change: Option<ChangeCallback>,
    on_presence: Option<PresenceCallback>,
    on_conflict: Option<ConflictCallback>,
}

impl SubscriptionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(f));
        self
    }

    pub fn on_presence<F>(mut self, f: F) -> Self
    where
        F: Fn(&PresenceRoster) + Send + Sync + 'static,
    {
        self.on_presence = Some(Arc::new(f));
        self
    }

    pub fn on_conflict<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConflictRecord) + Send + Sync + 'static,
    {
        self.on_conflict = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for SubscriptionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCallbacks")
            .field("on_change", &self.on_change.is_some())
            .field("on_presence", &self.on_presence.is_some())
            .field("on_conflict", &self.on_conflict.is_some())
            .finish()
    }
}

struct Registration {
    generation: u64,
    callbacks: Arc<SubscriptionCallbacks>,
}

struct ChannelEntry<H> {
    generation: u64,
    handle: Arc<H>,
    pump: Option<JoinHandle<()>>,
    /// Cleared when the transport reports the channel errored or closed.
    live: bool,
}

/// Everything the manager tracks, guarded by one mutex.
struct ManagerState<H> {
    status: ConnectionStatus,
    channels: HashMap<ProjectId, ChannelEntry<H>>,
    rosters: HashMap<ProjectId, PresenceTracker>,
    local_presence: HashMap<ProjectId, PresenceEntry>,
    callbacks: HashMap<ProjectId, Registration>,
    pending: OptimisticLedger,
    /// Subscribes between `Connecting` and their outcome.
    connecting: usize,
    probe: Option<JoinHandle<()>>,
}

impl<H> Default for ManagerState<H> {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            channels: HashMap::new(),
            rosters: HashMap::new(),
            local_presence: HashMap::new(),
            callbacks: HashMap::new(),
            pending: OptimisticLedger::new(),
            connecting: 0,
            probe: None,
        }
    }
}

impl<H> ManagerState<H> {
    fn is_current(&self, project_id: ProjectId, generation: u64) -> bool {
        self.callbacks
            .get(&project_id)
            .is_some_and(|r| r.generation == generation)
    }

    fn current_callbacks(
        &self,
        project_id: ProjectId,
        generation: u64,
    ) -> Option<Arc<SubscriptionCallbacks>> {
        self.callbacks
            .get(&project_id)
            .filter(|r| r.generation == generation)
            .map(|r| r.callbacks.clone())
    }
}

struct Shared<H> {
    config: RealtimeConfig,
    state: Mutex<ManagerState<H>>,
    bus: EventBus<BusEvent>,
    next_generation: AtomicU64,
}

impl<H: ChannelHandle> Shared<H> {
    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut state = self.state.lock();
            if state.status == status {
                false
            } else {
                state.status = status;
                true
            }
        };
        if changed {
            log::info!("Connection status: {status}");
            self.bus
                .emit(topics::CONNECTION, &BusEvent::Connection(status));
        }
    }

    /// Route one transport event. Returns `false` once the subscription is stale.
    fn dispatch(
        &self,
        project_id: ProjectId,
        generation: u64,
        local_actor: ActorId,
        event: TransportEvent,
    ) -> bool {
        match event {
            TransportEvent::Change(raw) => {
                if let Some(other) = raw.project_id().filter(|p| *p != project_id) {
                    log::debug!("Dropping change for project {other} on channel of {project_id}");
                    return true;
                }
                let Some(change) = normalize(raw, local_actor) else {
                    return true;
                };

                let (callbacks, conflict) = {
                    let mut state = self.state.lock();
                    let Some(callbacks) = state.current_callbacks(project_id, generation) else {
                        return false;
                    };
                    let conflict = state.pending.reconcile(project_id, &change);
                    (callbacks, conflict)
                };

                log::trace!(
                    "{} block {} by {} ({})",
                    change.kind,
                    change.block.id,
                    change.actor_id,
                    change.operation_id
                );
                if let Some(on_change) = &callbacks.on_change {
                    invoke_isolated("on_change", || on_change(&change));
                }
                self.bus.emit(
                    topics::BLOCK_CHANGE,
                    &BusEvent::BlockChange {
                        project_id,
                        event: change,
                    },
                );

                if let Some(record) = conflict {
                    log::info!(
                        "Conflict on block {} in project {project_id}: local {:?} vs remote {:?}",
                        record.block_id(),
                        record.local_fields(),
                        record.remote_fields()
                    );
                    if let Some(on_conflict) = &callbacks.on_conflict {
                        invoke_isolated("on_conflict", || on_conflict(&record));
                    }
                    self.bus
                        .emit(topics::CONFLICT, &BusEvent::Conflict { project_id, record });
                }
            }
            TransportEvent::Presence(delta) => {
                let (callbacks, roster) = {
                    let mut state = self.state.lock();
                    let Some(callbacks) = state.current_callbacks(project_id, generation) else {
                        return false;
                    };
                    let roster = state.rosters.entry(project_id).or_default().apply(delta);
                    (callbacks, roster)
                };

                if let Some(on_presence) = &callbacks.on_presence {
                    invoke_isolated("on_presence", || on_presence(&roster));
                }
                self.bus
                    .emit(topics::PRESENCE, &BusEvent::Presence { project_id, roster });
            }
            TransportEvent::Status(status) => {
                let others_live = {
                    let mut state = self.state.lock();
                    if !state.is_current(project_id, generation) {
                        return false;
                    }
                    if let Some(entry) = state
                        .channels
                        .get_mut(&project_id)
                        .filter(|c| c.generation == generation)
                    {
                        entry.live = status == SubscribeStatus::Subscribed;
                    }
                    state
                        .channels
                        .iter()
                        .any(|(other, c)| *other != project_id && c.live)
                };
                match status {
                    SubscribeStatus::Subscribed => self.set_status(ConnectionStatus::Connected),
                    SubscribeStatus::ChannelError | SubscribeStatus::TimedOut => {
                        log::warn!("Channel for project {project_id} reported {status}");
                        self.set_status(ConnectionStatus::Error);
                    }
                    SubscribeStatus::Closed if others_live => {
                        log::info!(
                            "Channel for project {project_id} closed by transport, others remain open"
                        );
                    }
                    SubscribeStatus::Closed => {
                        log::info!("Channel for project {project_id} closed by transport");
                        self.set_status(ConnectionStatus::Disconnected);
                    }
                }
            }
        }
        true
    }

    /// Tear down the subscription of `project_id`. With `only_generation`,
    /// only that exact subscription is torn down.
    async fn unsubscribe(&self, project_id: ProjectId, only_generation: Option<u64>) -> bool {
        let (generation, teardown) = {
            let mut state = self.state.lock();
            let generation = state
                .callbacks
                .get(&project_id)
                .map(|r| r.generation)
                .or_else(|| state.channels.get(&project_id).map(|c| c.generation));
            let Some(generation) = generation else {
                return false;
            };
            if only_generation.is_some_and(|g| g != generation) {
                return false;
            }

            // No callback runs once this entry is gone.
            state.callbacks.remove(&project_id);
            let teardown = state
                .channels
                .get_mut(&project_id)
                .filter(|c| c.generation == generation)
                .map(|c| (c.handle.clone(), c.pump.take()));
            (generation, teardown)
        };

        if let Some((handle, pump)) = teardown {
            if let Some(pump) = pump {
                pump.abort();
                // Let an in-flight dispatch finish before returning.
                let _ = pump.await;
            }
            handle.close().await;
        }

        {
            let mut state = self.state.lock();
            let ours = state
                .channels
                .get(&project_id)
                .map_or(true, |c| c.generation == generation);
            if ours {
                state.channels.remove(&project_id);
                state.rosters.remove(&project_id);
                state.local_presence.remove(&project_id);
                state.pending.drop_project(project_id);
            }
        }
        log::info!("Unsubscribed from project {project_id}");
        true
    }

    /// Ping every channel once. `None` if the probe was skipped.
    async fn probe(&self) -> Option<ConnectionStatus> {
        let handles: Vec<(ProjectId, Arc<H>)> = {
            let state = self.state.lock();
            if state.connecting > 0 || state.channels.is_empty() {
                return None;
            }
            state
                .channels
                .iter()
                .map(|(project_id, c)| (*project_id, c.handle.clone()))
                .collect()
        };

        let mut healthy = true;
        for (project_id, handle) in handles {
            match timeout(self.config.ping_timeout(), handle.ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("Health probe failed for project {project_id}: {e}");
                    healthy = false;
                }
                Err(_) => {
                    log::warn!("Health probe timed out for project {project_id}");
                    healthy = false;
                }
            }
        }

        let current = {
            let state = self.state.lock();
            if state.connecting > 0 {
                return None;
            }
            state.status
        };
        if !healthy {
            self.set_status(ConnectionStatus::Error);
        } else if current == ConnectionStatus::Error {
            self.set_status(ConnectionStatus::Connected);
        }
        Some(self.state.lock().status)
    }
}

/// Holds one `ManagerState::connecting` slot until dropped.
///
/// A subscribe future dropped before settling (cancelled by the caller) still
/// releases its slot; if it was the last one, the status moves from
/// `Connecting` to `Error`.
struct ConnectingGuard<'a, H: ChannelHandle> {
    shared: &'a Shared<H>,
    settled: bool,
}

impl<'a, H: ChannelHandle> ConnectingGuard<'a, H> {
    fn enter(shared: &'a Shared<H>) -> Self {
        shared.state.lock().connecting += 1;
        Self {
            shared,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl<H: ChannelHandle> Drop for ConnectingGuard<'_, H> {
    fn drop(&mut self) {
        let abandoned = {
            let mut state = self.shared.state.lock();
            state.connecting = state.connecting.saturating_sub(1);
            !self.settled && state.connecting == 0 && state.status == ConnectionStatus::Connecting
        };
        if abandoned {
            log::warn!("Subscribe abandoned before completing");
            self.shared.set_status(ConnectionStatus::Error);
        }
    }
}

/// Handle to one subscription, returned by [`ChannelManager::subscribe`].
///
/// Becomes inert once the subscription is replaced or torn down.
pub struct SubscriptionHandle<H> {
    project_id: ProjectId,
    generation: u64,
    shared: Weak<Shared<H>>,
}

impl<H: ChannelHandle> SubscriptionHandle<H> {
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Whether this handle still refers to the live subscription.
    pub fn is_active(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                let state = shared.state.lock();
                state.is_current(self.project_id, self.generation)
            }
            None => false,
        }
    }

    /// Tear down this subscription. No-op if it was already replaced.
    pub async fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .unsubscribe(self.project_id, Some(self.generation))
                .await;
        }
    }
}

impl<H> std::fmt::Debug for SubscriptionHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("project_id", &self.project_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Owns one realtime channel per project.
///
/// Cloning is cheap; clones share the same channels and event bus.
pub struct ChannelManager<T: ChannelTransport> {
    transport: Arc<T>,
    shared: Arc<Shared<T::Handle>>,
}

impl<T: ChannelTransport> Clone for ChannelManager<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: ChannelTransport> ChannelManager<T> {
    pub fn new(transport: T, config: RealtimeConfig) -> Result<Self, RealtimeError> {
        config.validate()?;
        Ok(Self {
            transport: Arc::new(transport),
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ManagerState::default()),
                bus: EventBus::new(),
                next_generation: AtomicU64::new(1),
            }),
        })
    }

    /// Open (or replace) the channel for `project_id`.
    ///
    /// Transport failures are reported through the connection status, never
    /// as `Err`; the returned handle is valid either way.
    pub async fn subscribe(
        &self,
        project_id: ProjectId,
        actor: LocalActor,
        callbacks: SubscriptionCallbacks,
    ) -> Result<SubscriptionHandle<T::Handle>, RealtimeError> {
        if project_id.is_nil() {
            return Err(RealtimeError::InvalidProject(project_id));
        }
        if actor.id.is_nil() {
            return Err(RealtimeError::InvalidActor(actor.id));
        }

        if self.shared.unsubscribe(project_id, None).await {
            log::debug!("Replacing subscription for project {project_id}");
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().callbacks.insert(
            project_id,
            Registration {
                generation,
                callbacks: Arc::new(callbacks),
            },
        );
        let connecting = ConnectingGuard::enter(&self.shared);
        self.shared.set_status(ConnectionStatus::Connecting);
        log::info!("Subscribing to project {project_id} as {}", actor.id);

        let outcome = self.open(project_id, &actor, generation).await;
        connecting.settle();

        match outcome {
            Ok(true) => self.shared.set_status(ConnectionStatus::Connected),
            Ok(false) => log::debug!("Subscription {generation} for {project_id} was superseded"),
            Err(e) => {
                log::warn!("Failed to subscribe to project {project_id}: {e}");
                self.shared.set_status(ConnectionStatus::Error);
            }
        }
        self.ensure_probe();

        Ok(SubscriptionHandle {
            project_id,
            generation,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Returns `Ok(false)` if a newer subscription replaced this one meanwhile.
    async fn open(
        &self,
        project_id: ProjectId,
        actor: &LocalActor,
        generation: u64,
    ) -> Result<bool, TransportError> {
        let config = &self.shared.config;
        let spec = ChannelSpec {
            name: config.channel_name(project_id),
            presence_key: actor.id,
            filter: ChangeFilter::project(project_id),
            event_buffer: config.event_buffer,
        };
        let opened = timeout(config.subscribe_timeout(), self.transport.open_channel(spec)).await;
        let handle = match opened {
            Ok(handle) => Arc::new(handle?),
            Err(_) => return Err(TransportError::Timeout),
        };
        let events = handle.take_events();

        let status = timeout(config.subscribe_timeout(), handle.subscribe())
            .await
            .unwrap_or(SubscribeStatus::TimedOut);
        if status != SubscribeStatus::Subscribed {
            handle.close().await;
            return Err(TransportError::Subscribe(status.to_string()));
        }

        let local = PresenceEntry::for_actor(actor, project_id);
        let installed = {
            let mut state = self.shared.state.lock();
            if state.is_current(project_id, generation) {
                let pump = events.map(|events| {
                    spawn_pump(
                        Arc::downgrade(&self.shared),
                        project_id,
                        generation,
                        actor.id,
                        events,
                    )
                });
                if pump.is_none() {
                    log::warn!("Channel for project {project_id} has no event stream");
                }
                state.rosters.insert(project_id, PresenceTracker::new());
                state.local_presence.insert(project_id, local.clone());
                state.channels.insert(
                    project_id,
                    ChannelEntry {
                        generation,
                        handle: handle.clone(),
                        pump,
                        live: true,
                    },
                );
                true
            } else {
                false
            }
        };
        if !installed {
            handle.close().await;
            return Ok(false);
        }

        handle.track(&local).await?;
        Ok(true)
    }

    /// Tear down the subscription for `project_id`. Idempotent.
    pub async fn unsubscribe(&self, project_id: ProjectId) {
        self.shared.unsubscribe(project_id, None).await;
    }

    /// Merge `update` into the local presence and re-publish it.
    /// No-op when the project has no open channel.
    pub async fn update_presence(&self, project_id: ProjectId, update: PresenceUpdate) {
        let published = {
            let mut state = self.shared.state.lock();
            let handle = match state.channels.get(&project_id) {
                Some(channel) => channel.handle.clone(),
                None => return,
            };
            state.local_presence.get_mut(&project_id).map(|entry| {
                entry.apply(update);
                (handle, entry.clone())
            })
        };

        if let Some((handle, entry)) = published {
            if let Err(e) = handle.track(&entry).await {
                log::warn!("Failed to publish presence for project {project_id}: {e}");
            }
        }
    }

    /// Register a local edit the store has not acknowledged yet.
    ///
    /// Returns `false` when the project is not subscribed or the two
    /// snapshots are of different blocks.
    pub fn record_optimistic_edit(
        &self,
        project_id: ProjectId,
        baseline: Block,
        optimistic: Block,
    ) -> bool {
        if baseline.id != optimistic.id {
            log::warn!(
                "Optimistic edit of {} recorded against baseline {}",
                optimistic.id,
                baseline.id
            );
            return false;
        }
        let mut state = self.shared.state.lock();
        if !state.channels.contains_key(&project_id) {
            return false;
        }
        state.pending.record(project_id, baseline, optimistic);
        true
    }

    /// Drop a pending edit once the store acknowledged it.
    pub fn settle_optimistic_edit(&self, project_id: ProjectId, block_id: BlockId) -> bool {
        self.shared
            .state
            .lock()
            .pending
            .settle(project_id, block_id)
            .is_some()
    }

    /// Unsubscribe everything and reset all internal state.
    pub async fn cleanup(&self) {
        let projects: Vec<ProjectId> = {
            let state = self.shared.state.lock();
            let mut projects: Vec<ProjectId> = state.callbacks.keys().copied().collect();
            for project_id in state.channels.keys() {
                if !projects.contains(project_id) {
                    projects.push(*project_id);
                }
            }
            projects
        };
        let count = projects.len();
        for project_id in projects {
            self.shared.unsubscribe(project_id, None).await;
        }

        let probe = {
            let mut state = self.shared.state.lock();
            state.channels.clear();
            state.rosters.clear();
            state.local_presence.clear();
            state.callbacks.clear();
            state.pending.clear();
            state.connecting = 0;
            state.probe.take()
        };
        if let Some(probe) = probe {
            probe.abort();
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
        log::info!("Realtime cleanup complete ({count} subscriptions released)");
    }

    /// Ping every open channel once and update the connection status.
    ///
    /// Returns the resulting status, or `None` if the probe was skipped
    /// (no channels, or a subscribe is in flight).
    pub async fn probe_health(&self) -> Option<ConnectionStatus> {
        self.shared.probe().await
    }

    fn ensure_probe(&self) {
        let Some(interval) = self.shared.config.health_probe_interval() else {
            return;
        };
        let mut state = self.shared.state.lock();
        if state.probe.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }

        let shared = Arc::downgrade(&self.shared);
        state.probe = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.probe().await;
            }
        }));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().status
    }

    pub fn is_subscribed(&self, project_id: ProjectId) -> bool {
        self.shared.state.lock().channels.contains_key(&project_id)
    }

    /// Current roster of `project_id` (empty when not subscribed).
    pub fn roster(&self, project_id: ProjectId) -> PresenceRoster {
        self.shared
            .state
            .lock()
            .rosters
            .get(&project_id)
            .map(PresenceTracker::roster)
            .unwrap_or_default()
    }

    pub fn local_presence(&self, project_id: ProjectId) -> Option<PresenceEntry> {
        self.shared
            .state
            .lock()
            .local_presence
            .get(&project_id)
            .cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.shared.state.lock().channels.len()
    }

    pub fn roster_count(&self) -> usize {
        self.shared.state.lock().rosters.len()
    }

    /// Number of registered callback sets.
    pub fn listener_count(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    pub fn pending_edit_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn bus(&self) -> &EventBus<BusEvent> {
        &self.shared.bus
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }
}

fn spawn_pump<H: ChannelHandle>(
    shared: Weak<Shared<H>>,
    project_id: ProjectId,
    generation: u64,
    local_actor: ActorId,
    mut events: mpsc::Receiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if !shared.dispatch(project_id, generation, local_actor, event) {
                break;
            }
        }
        log::trace!("Event pump for project {project_id} (generation {generation}) stopped");
    })
}
