//! Channel manager scenarios over the in-memory transport.
//!
//! Each test drives a real `ChannelManager` against a `MemoryTransport` hub,
//! publishing change notifications and presence the way a store and other
//! collaborators would.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_collab::{
    topics, BusEvent, ChangeEvent, ChangeKind, ChannelManager, ChannelSpec, ChannelTransport,
    ConnectionStatus, LocalActor, MemoryChannelHandle, MemoryTransport, PresenceRoster,
    PresenceUpdate, RawNotification, RealtimeConfig, SubscribeStatus, SubscriptionCallbacks,
    TransportError, Vec2,
};
use tessera_core::{Block, BlockStatus, ConflictRecord, Progress, ProjectId};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn config() -> RealtimeConfig {
    RealtimeConfig {
        subscribe_timeout_ms: 1_000,
        health_probe_interval_secs: None,
        ..RealtimeConfig::default()
    }
}

fn actor(name: &str) -> LocalActor {
    LocalActor::new(
        Uuid::new_v4(),
        name,
        format!("{}@example.com", name.to_lowercase()),
    )
}

fn manager(transport: &MemoryTransport) -> ChannelManager<MemoryTransport> {
    ChannelManager::new(transport.clone(), config()).unwrap()
}

/// Receivers fed by a subscription's callbacks.
struct Recorder {
    changes: UnboundedReceiver<ChangeEvent>,
    presence: UnboundedReceiver<PresenceRoster>,
    conflicts: UnboundedReceiver<ConflictRecord>,
}

fn recorder() -> (SubscriptionCallbacks, Recorder) {
    let (change_tx, changes) = unbounded_channel();
    let (presence_tx, presence) = unbounded_channel();
    let (conflict_tx, conflicts) = unbounded_channel();
    let callbacks = SubscriptionCallbacks::new()
        .on_change(move |e: &ChangeEvent| {
            let _ = change_tx.send(e.clone());
        })
        .on_presence(move |r: &PresenceRoster| {
            let _ = presence_tx.send(r.clone());
        })
        .on_conflict(move |c: &ConflictRecord| {
            let _ = conflict_tx.send(c.clone());
        });
    (
        callbacks,
        Recorder {
            changes,
            presence,
            conflicts,
        },
    )
}

async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

/// Receive rosters until one satisfies `pred`.
async fn wait_roster<F>(rx: &mut UnboundedReceiver<PresenceRoster>, pred: F) -> PresenceRoster
where
    F: Fn(&PresenceRoster) -> bool,
{
    loop {
        let roster = recv(rx).await;
        if pred(&roster) {
            return roster;
        }
    }
}

fn status_feed<T: ChannelTransport>(manager: &ChannelManager<T>) -> UnboundedReceiver<ConnectionStatus> {
    let (tx, rx) = unbounded_channel();
    let _ = manager.bus().on(topics::CONNECTION, move |event: &BusEvent| {
        if let BusEvent::Connection(status) = event {
            let _ = tx.send(*status);
        }
    });
    rx
}

fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

fn channel_name(project: ProjectId) -> String {
    config().channel_name(project)
}

/// Memory transport whose `open_channel` can be made to hang.
#[derive(Clone, Default)]
struct StallingTransport {
    inner: MemoryTransport,
    stall: Arc<AtomicBool>,
}

impl StallingTransport {
    fn set_stall(&self, on: bool) {
        self.stall.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelTransport for StallingTransport {
    type Handle = MemoryChannelHandle;

    async fn open_channel(&self, spec: ChannelSpec) -> Result<MemoryChannelHandle, TransportError> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.open_channel(spec).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_subscribe_connects_and_tracks_presence() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let mut statuses = status_feed(&manager);
    let project = Uuid::new_v4();
    let alice = actor("Alice");
    let (callbacks, mut rec) = recorder();

    manager
        .subscribe(project, alice.clone(), callbacks)
        .await
        .unwrap();

    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(
        drain(&mut statuses),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
    assert!(manager.is_subscribed(project));
    assert_eq!(manager.channel_count(), 1);
    assert_eq!(manager.listener_count(), 1);
    assert_eq!(transport.members(&channel_name(project)), vec![alice.id]);

    let roster = wait_roster(&mut rec.presence, |r| r.contains_key(&alice.id)).await;
    assert_eq!(roster[&alice.id].email, "alice@example.com");
    assert_eq!(manager.roster(project).len(), 1);

    let local = manager.local_presence(project).unwrap();
    assert_eq!(local.actor_id, alice.id);
    assert_eq!(local.active_project, project);
}

#[tokio::test]
async fn test_unsubscribe_twice_is_noop() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();

    manager
        .subscribe(project, actor("Alice"), SubscriptionCallbacks::new())
        .await
        .unwrap();
    manager.unsubscribe(project).await;
    manager.unsubscribe(project).await;
    manager.unsubscribe(Uuid::new_v4()).await;

    assert!(!manager.is_subscribed(project));
    assert_eq!(manager.channel_count(), 0);
    assert_eq!(manager.roster_count(), 0);
    assert_eq!(manager.listener_count(), 0);
    assert!(manager.local_presence(project).is_none());
    assert_eq!(transport.open_handles(), 0);
}

#[tokio::test]
async fn test_no_callbacks_after_unsubscribe() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let (callbacks, mut rec) = recorder();

    manager
        .subscribe(project, actor("Alice"), callbacks)
        .await
        .unwrap();
    manager.unsubscribe(project).await;

    let block = Block::new(project, "Late arrival", Uuid::new_v4());
    transport.publish_change(RawNotification::inserted(block));

    // Callbacks were released with the subscription: the channel drains and closes.
    let result = timeout(Duration::from_millis(200), rec.changes.recv()).await;
    assert!(!matches!(result, Ok(Some(_))));
}

#[tokio::test]
async fn test_resubscribe_replaces_and_stale_handle_is_inert() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let alice = actor("Alice");
    let (first_callbacks, mut first) = recorder();
    let (second_callbacks, mut second) = recorder();

    let stale = manager
        .subscribe(project, alice.clone(), first_callbacks)
        .await
        .unwrap();
    let live = manager
        .subscribe(project, alice.clone(), second_callbacks)
        .await
        .unwrap();

    assert!(!stale.is_active());
    assert!(live.is_active());
    assert_eq!(manager.channel_count(), 1);
    assert_eq!(transport.open_handles(), 1);
    assert_eq!(transport.total_opened(), 2);

    // Stale handle does not tear down the replacement.
    stale.unsubscribe().await;
    assert!(manager.is_subscribed(project));

    let block = Block::new(project, "Routed to the new subscription", Uuid::new_v4());
    transport.publish_change(RawNotification::inserted(block.clone()));
    assert_eq!(recv(&mut second.changes).await.block, block);
    let old = timeout(Duration::from_millis(100), first.changes.recv()).await;
    assert!(!matches!(old, Ok(Some(_))));

    live.unsubscribe().await;
    assert!(!manager.is_subscribed(project));
    assert_eq!(transport.open_handles(), 0);
}

#[tokio::test]
async fn test_open_failure_sets_error_but_returns_handle() {
    let transport = MemoryTransport::new();
    transport.set_reject_open(true);
    let manager = manager(&transport);
    let mut statuses = status_feed(&manager);
    let project = Uuid::new_v4();

    let handle = manager
        .subscribe(project, actor("Alice"), SubscriptionCallbacks::new())
        .await
        .unwrap();

    assert_eq!(manager.status(), ConnectionStatus::Error);
    assert_eq!(
        drain(&mut statuses),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
    );
    assert!(!manager.is_subscribed(project));
    assert_eq!(manager.listener_count(), 1);

    handle.unsubscribe().await;
    assert_eq!(manager.listener_count(), 0);
}

#[tokio::test]
async fn test_subscribe_rejected_closes_channel() {
    let transport = MemoryTransport::new();
    transport.set_reject_subscribe(true);
    let manager = manager(&transport);

    manager
        .subscribe(Uuid::new_v4(), actor("Alice"), SubscriptionCallbacks::new())
        .await
        .unwrap();

    assert_eq!(manager.status(), ConnectionStatus::Error);
    assert_eq!(manager.channel_count(), 0);
    assert_eq!(transport.open_handles(), 0);
    assert_eq!(transport.total_opened(), 1);
}

#[tokio::test]
async fn test_error_recovers_on_resubscribe() {
    let transport = MemoryTransport::new();
    transport.set_reject_open(true);
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let alice = actor("Alice");

    manager
        .subscribe(project, alice.clone(), SubscriptionCallbacks::new())
        .await
        .unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Error);

    let mut statuses = status_feed(&manager);
    transport.set_reject_open(false);
    manager
        .subscribe(project, alice, SubscriptionCallbacks::new())
        .await
        .unwrap();
    assert_eq!(
        drain(&mut statuses),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
}

#[tokio::test]
async fn test_cleanup_empties_all_state() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let alice = actor("Alice");
    let projects: Vec<ProjectId> = (0..3).map(|_| Uuid::new_v4()).collect();

    for project in &projects {
        manager
            .subscribe(*project, alice.clone(), SubscriptionCallbacks::new())
            .await
            .unwrap();
    }
    let block = Block::new(projects[0], "Pending", alice.id);
    assert!(manager.record_optimistic_edit(projects[0], block.clone(), block));
    assert_eq!(manager.channel_count(), 3);

    manager.cleanup().await;

    assert_eq!(manager.channel_count(), 0);
    assert_eq!(manager.roster_count(), 0);
    assert_eq!(manager.listener_count(), 0);
    assert_eq!(manager.pending_edit_count(), 0);
    assert!(manager.local_presence(projects[1]).is_none());
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert_eq!(transport.open_handles(), 0);

    // Idempotent
    manager.cleanup().await;
    assert_eq!(manager.channel_count(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Change routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_remote_change_delivered_and_mirrored() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let remote = Uuid::new_v4();
    let (callbacks, mut rec) = recorder();

    let (tx, mut mirrored) = unbounded_channel();
    let _sub = manager.bus().on(topics::BLOCK_CHANGE, move |event: &BusEvent| {
        if let BusEvent::BlockChange { project_id, event } = event {
            let _ = tx.send((*project_id, event.block.id));
        }
    });

    manager
        .subscribe(project, actor("Alice"), callbacks)
        .await
        .unwrap();

    let block = Block::new(project, "Draft launch plan", remote);
    transport.publish_change(RawNotification::inserted(block.clone()));

    let event = recv(&mut rec.changes).await;
    assert_eq!(event.kind, ChangeKind::Inserted);
    assert_eq!(event.block, block);
    assert_eq!(event.actor_id, remote);
    assert_eq!(recv(&mut mirrored).await, (project, block.id));
}

#[tokio::test]
async fn test_local_echo_suppressed() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let alice = actor("Alice");
    let remote = Uuid::new_v4();
    let (callbacks, mut rec) = recorder();

    manager
        .subscribe(project, alice.clone(), callbacks)
        .await
        .unwrap();

    let before = Block::new(project, "Echo me", remote);
    let mut mine = before.clone().with_progress(Progress::saturating(50));
    mine.updated_by = alice.id;
    transport.publish_change(RawNotification::updated(before.clone(), mine));

    let theirs = before.clone().with_status(BlockStatus::Done);
    transport.publish_change(RawNotification::updated(before, theirs.clone()));

    // Per-channel order holds, so the first delivery being the remote write
    // proves the echo was dropped.
    let event = recv(&mut rec.changes).await;
    assert_eq!(event.block, theirs);
    assert_eq!(event.actor_id, remote);
}

#[tokio::test]
async fn test_foreign_and_malformed_notifications_dropped() {
    let transport = MemoryTransport::new();
    transport.set_unscoped(true);
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let (callbacks, mut rec) = recorder();

    manager
        .subscribe(project, actor("Alice"), callbacks)
        .await
        .unwrap();

    let foreign = Block::new(Uuid::new_v4(), "Not ours", Uuid::new_v4());
    transport.publish_change(RawNotification::inserted(foreign));
    transport.publish_change(RawNotification {
        kind: ChangeKind::Updated,
        new: None,
        old: None,
        commit_timestamp: None,
    });
    let ours = Block::new(project, "Ours", Uuid::new_v4());
    transport.publish_change(RawNotification::removed(ours.clone()));

    let event = recv(&mut rec.changes).await;
    assert_eq!(event.kind, ChangeKind::Removed);
    assert_eq!(event.block, ours);
}

#[tokio::test]
async fn test_panicking_callback_does_not_stop_pump() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();

    let (tx, mut mirrored) = unbounded_channel();
    let _sub = manager.bus().on(topics::BLOCK_CHANGE, move |event: &BusEvent| {
        if let BusEvent::BlockChange { event, .. } = event {
            let _ = tx.send(event.block.title.clone());
        }
    });

    let callbacks = SubscriptionCallbacks::new().on_change(|_| panic!("host bug"));
    manager.subscribe(project, actor("Alice"), callbacks).await.unwrap();

    for title in ["one", "two"] {
        let block = Block::new(project, title, Uuid::new_v4());
        transport.publish_change(RawNotification::inserted(block));
    }

    assert_eq!(recv(&mut mirrored).await, "one");
    assert_eq!(recv(&mut mirrored).await, "two");
}

// ─────────────────────────────────────────────────────────────────────────────
// Presence
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_peer_leave_updates_roster() {
    let transport = MemoryTransport::new();
    let project = Uuid::new_v4();
    let alice = actor("Alice");
    let bob = actor("Bob");

    let manager_a = manager(&transport);
    let manager_b = manager(&transport);
    let (callbacks_a, mut rec_a) = recorder();

    manager_a
        .subscribe(project, alice.clone(), callbacks_a)
        .await
        .unwrap();
    manager_b
        .subscribe(project, bob.clone(), SubscriptionCallbacks::new())
        .await
        .unwrap();

    let roster = wait_roster(&mut rec_a.presence, |r| r.len() == 2).await;
    assert!(roster.contains_key(&alice.id));
    assert!(roster.contains_key(&bob.id));

    manager_b.unsubscribe(project).await;

    let roster = wait_roster(&mut rec_a.presence, |r| r.len() == 1).await;
    assert!(roster.contains_key(&alice.id));
    assert!(!roster.contains_key(&bob.id));
    assert_eq!(manager_a.roster(project).len(), 1);
}

#[tokio::test]
async fn test_late_joiner_receives_full_sync() {
    let transport = MemoryTransport::new();
    let project = Uuid::new_v4();
    let alice = actor("Alice");
    let bob = actor("Bob");

    let manager_a = manager(&transport);
    manager_a
        .subscribe(project, alice.clone(), SubscriptionCallbacks::new())
        .await
        .unwrap();

    let manager_b = manager(&transport);
    let (callbacks_b, mut rec_b) = recorder();
    manager_b
        .subscribe(project, bob.clone(), callbacks_b)
        .await
        .unwrap();

    let roster = wait_roster(&mut rec_b.presence, |r| r.len() == 2).await;
    assert!(roster.contains_key(&alice.id));
}

#[tokio::test]
async fn test_update_presence_reaches_peers() {
    let transport = MemoryTransport::new();
    let project = Uuid::new_v4();
    let alice = actor("Alice");
    let bob = actor("Bob");
    let focused = Uuid::new_v4();

    let manager_a = manager(&transport);
    let manager_b = manager(&transport);
    let (callbacks_b, mut rec_b) = recorder();
    manager_a
        .subscribe(project, alice.clone(), SubscriptionCallbacks::new())
        .await
        .unwrap();
    manager_b
        .subscribe(project, bob.clone(), callbacks_b)
        .await
        .unwrap();

    let before = manager_a.local_presence(project).unwrap().last_seen;
    manager_a
        .update_presence(
            project,
            PresenceUpdate::focus_block(focused).with_cursor(Some(Vec2::new(4.0, 2.0))),
        )
        .await;

    let local = manager_a.local_presence(project).unwrap();
    assert_eq!(local.active_block, Some(focused));
    assert!(local.last_seen >= before);

    let roster = wait_roster(&mut rec_b.presence, |r| {
        r.get(&alice.id)
            .is_some_and(|e| e.active_block == Some(focused))
    })
    .await;
    assert_eq!(roster[&alice.id].cursor, Some(Vec2::new(4.0, 2.0)));

    // No channel: silently ignored
    manager_a
        .update_presence(Uuid::new_v4(), PresenceUpdate::blur_block())
        .await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Conflicts
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_conflict_routed_to_on_conflict() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let alice = actor("Alice");
    let remote = Uuid::new_v4();
    let (callbacks, mut rec) = recorder();

    let (tx, mut mirrored) = unbounded_channel();
    let _sub = manager.bus().on(topics::CONFLICT, move |event: &BusEvent| {
        if let BusEvent::Conflict { record, .. } = event {
            let _ = tx.send(record.block_id());
        }
    });

    manager
        .subscribe(project, alice.clone(), callbacks)
        .await
        .unwrap();

    let baseline = Block::new(project, "Customer interviews", remote)
        .with_status(BlockStatus::Active)
        .with_progress(Progress::saturating(30));
    let mut optimistic = baseline.clone().with_progress(Progress::saturating(40));
    optimistic.updated_by = alice.id;
    assert!(manager.record_optimistic_edit(project, baseline.clone(), optimistic));

    let server = baseline
        .clone()
        .with_progress(Progress::saturating(35))
        .with_status(BlockStatus::Blocked);
    transport.publish_change(RawNotification::updated(baseline, server.clone()));

    let change = recv(&mut rec.changes).await;
    assert_eq!(change.block, server);

    let record = recv(&mut rec.conflicts).await;
    assert_eq!(record.resolved.progress.value(), 40);
    assert_eq!(record.resolved.status, BlockStatus::Blocked);
    assert_eq!(record.project_id(), project);
    assert_eq!(recv(&mut mirrored).await, record.block_id());
    assert_eq!(manager.pending_edit_count(), 0);
}

#[tokio::test]
async fn test_settled_edit_does_not_conflict() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let alice = actor("Alice");
    let (callbacks, mut rec) = recorder();

    manager
        .subscribe(project, alice.clone(), callbacks)
        .await
        .unwrap();

    let baseline = Block::new(project, "Budget", Uuid::new_v4());
    let optimistic = baseline.clone().with_lane("doing");
    assert!(manager.record_optimistic_edit(project, baseline.clone(), optimistic));
    assert!(manager.settle_optimistic_edit(project, baseline.id));

    let server = baseline.clone().with_status(BlockStatus::Review);
    transport.publish_change(RawNotification::updated(baseline, server));

    recv(&mut rec.changes).await;
    let conflict = timeout(Duration::from_millis(100), rec.conflicts.recv()).await;
    assert!(conflict.is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Status and health
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mid_session_status_reports() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    manager
        .subscribe(project, actor("Alice"), SubscriptionCallbacks::new())
        .await
        .unwrap();
    let mut statuses = status_feed(&manager);

    transport.emit_status(&channel_name(project), SubscribeStatus::TimedOut);
    assert_eq!(recv(&mut statuses).await, ConnectionStatus::Error);

    transport.emit_status(&channel_name(project), SubscribeStatus::Subscribed);
    assert_eq!(recv(&mut statuses).await, ConnectionStatus::Connected);

    transport.emit_status(&channel_name(project), SubscribeStatus::Closed);
    assert_eq!(recv(&mut statuses).await, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_health_check_reports_and_restores() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    assert_eq!(manager.probe_health().await, None);

    manager
        .subscribe(Uuid::new_v4(), actor("Alice"), SubscriptionCallbacks::new())
        .await
        .unwrap();
    assert_eq!(
        manager.probe_health().await,
        Some(ConnectionStatus::Connected)
    );

    transport.set_unreachable(true);
    assert_eq!(manager.probe_health().await, Some(ConnectionStatus::Error));
    assert_eq!(manager.status(), ConnectionStatus::Error);

    transport.set_unreachable(false);
    assert_eq!(
        manager.probe_health().await,
        Some(ConnectionStatus::Connected)
    );
}

#[tokio::test]
async fn test_status_emitted_only_on_change() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let alice = actor("Alice");
    manager
        .subscribe(Uuid::new_v4(), alice.clone(), SubscriptionCallbacks::new())
        .await
        .unwrap();

    let mut statuses = status_feed(&manager);
    manager.probe_health().await;
    manager.probe_health().await;
    assert!(drain(&mut statuses).is_empty());
}

#[tokio::test]
async fn test_periodic_health_check_tracks_reachability() {
    let transport = MemoryTransport::new();
    let config = RealtimeConfig {
        health_probe_interval_secs: Some(1),
        ping_timeout_ms: 200,
        ..config()
    };
    let manager = ChannelManager::new(transport.clone(), config).unwrap();
    let mut statuses = status_feed(&manager);
    manager
        .subscribe(Uuid::new_v4(), actor("Alice"), SubscriptionCallbacks::new())
        .await
        .unwrap();
    drain(&mut statuses);

    transport.set_unreachable(true);
    let status = timeout(Duration::from_secs(3), statuses.recv()).await.unwrap();
    assert_eq!(status, Some(ConnectionStatus::Error));

    transport.set_unreachable(false);
    let status = timeout(Duration::from_secs(3), statuses.recv()).await.unwrap();
    assert_eq!(status, Some(ConnectionStatus::Connected));

    manager.cleanup().await;
}

#[tokio::test]
async fn test_closed_channel_keeps_status_while_others_live() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    for project in [first, second] {
        manager
            .subscribe(project, actor("Alice"), SubscriptionCallbacks::new())
            .await
            .unwrap();
    }
    let mut statuses = status_feed(&manager);

    transport.emit_status(&channel_name(first), SubscribeStatus::Closed);
    let quiet = timeout(Duration::from_millis(200), statuses.recv()).await;
    assert!(quiet.is_err());
    assert_eq!(manager.status(), ConnectionStatus::Connected);

    transport.emit_status(&channel_name(second), SubscribeStatus::Closed);
    assert_eq!(recv(&mut statuses).await, ConnectionStatus::Disconnected);
}

// ─────────────────────────────────────────────────────────────────────────────
// Cancellation and re-entrancy
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancelled_subscribe_does_not_block_health_check() {
    let transport = StallingTransport::default();
    transport.set_stall(true);
    let manager = ChannelManager::new(transport.clone(), config()).unwrap();

    let cancelled = timeout(
        Duration::from_millis(50),
        manager.subscribe(Uuid::new_v4(), actor("Alice"), SubscriptionCallbacks::new()),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(manager.status(), ConnectionStatus::Error);

    transport.set_stall(false);
    manager
        .subscribe(Uuid::new_v4(), actor("Alice"), SubscriptionCallbacks::new())
        .await
        .unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(
        manager.probe_health().await,
        Some(ConnectionStatus::Connected)
    );
}

#[tokio::test]
async fn test_cleanup_after_cancelled_subscribe() {
    let transport = StallingTransport::default();
    transport.set_stall(true);
    let manager = ChannelManager::new(transport.clone(), config()).unwrap();

    let cancelled = timeout(
        Duration::from_millis(50),
        manager.subscribe(Uuid::new_v4(), actor("Alice"), SubscriptionCallbacks::new()),
    )
    .await;
    assert!(cancelled.is_err());

    manager.cleanup().await;
    assert_eq!(manager.listener_count(), 0);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);

    transport.set_stall(false);
    manager
        .subscribe(Uuid::new_v4(), actor("Alice"), SubscriptionCallbacks::new())
        .await
        .unwrap();
    assert_eq!(
        manager.probe_health().await,
        Some(ConnectionStatus::Connected)
    );
}

#[tokio::test]
async fn test_hanging_open_times_out() {
    let transport = StallingTransport::default();
    transport.set_stall(true);
    let config = RealtimeConfig {
        subscribe_timeout_ms: 100,
        ..config()
    };
    let manager = ChannelManager::new(transport.clone(), config).unwrap();
    let mut statuses = status_feed(&manager);

    let handle = timeout(
        Duration::from_secs(2),
        manager.subscribe(Uuid::new_v4(), actor("Alice"), SubscriptionCallbacks::new()),
    )
    .await
    .expect("open was not bounded")
    .unwrap();

    assert_eq!(manager.status(), ConnectionStatus::Error);
    assert_eq!(
        drain(&mut statuses),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
    );
    assert_eq!(manager.channel_count(), 0);
    handle.unsubscribe().await;
    assert_eq!(manager.listener_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_from_own_callback() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let project = Uuid::new_v4();
    let (done_tx, mut done) = unbounded_channel();

    let handle = manager.clone();
    let callbacks = SubscriptionCallbacks::new().on_change(move |_| {
        let manager = handle.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            manager.unsubscribe(project).await;
            let _ = done_tx.send(manager.is_subscribed(project));
        });
    });
    manager
        .subscribe(project, actor("Alice"), callbacks)
        .await
        .unwrap();

    let block = Block::new(project, "Stop watching", Uuid::new_v4());
    transport.publish_change(RawNotification::inserted(block));

    assert!(!recv(&mut done).await);
    assert_eq!(manager.channel_count(), 0);
    assert_eq!(manager.listener_count(), 0);
    assert_eq!(transport.open_handles(), 0);
}

#[tokio::test]
async fn test_cleanup_while_unsubscribe_in_flight() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let projects: Vec<ProjectId> = (0..3).map(|_| Uuid::new_v4()).collect();
    for project in &projects {
        manager
            .subscribe(*project, actor("Alice"), SubscriptionCallbacks::new())
            .await
            .unwrap();
    }

    timeout(Duration::from_secs(2), async {
        tokio::join!(manager.unsubscribe(projects[0]), manager.cleanup())
    })
    .await
    .expect("teardown stalled");

    assert_eq!(manager.channel_count(), 0);
    assert_eq!(manager.roster_count(), 0);
    assert_eq!(manager.listener_count(), 0);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert_eq!(transport.open_handles(), 0);
}
