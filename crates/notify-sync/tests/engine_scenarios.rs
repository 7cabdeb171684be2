use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::broadcast;

use notify_sync::testing::{MemoryApi, RemoteHandle, ScriptedConnector, wait_until};
use notify_sync::{
    AlertLevel, Category, ConnectionIndicator, EngineHandle, Notification, NotificationEngine,
    PresentationEvent, SchedulerMode, Snapshot, SyncConfig,
};

fn config(use_push: bool, max_attempts: u32) -> SyncConfig {
    let mut config = SyncConfig {
        user_id: "42".to_string(),
        ..SyncConfig::default()
    };
    config.realtime.use_push = use_push;
    config.realtime.poll_interval_ms = 30_000;
    config.reconnect.max_attempts = max_attempts;
    config.reconnect.base_delay_ms = 1000;
    config.reconnect.max_delay_ms = 30_000;
    config
}

async fn wait_for_snapshot(handle: &EngineHandle, mut predicate: impl FnMut(&Snapshot) -> bool) -> Snapshot {
    for _ in 0..1000 {
        let snapshot = handle.snapshot().await.unwrap();
        if predicate(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("snapshot never satisfied the predicate");
}

fn note(id: i64, read: bool, minute: u32) -> Notification {
    let mut n = Notification::new(
        id,
        format!("notification {id}"),
        Category::Borrow,
        Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap(),
    );
    n.read = read;
    n
}

async fn push_engine(api: Arc<MemoryApi>) -> (NotificationEngine, ScriptedConnector, RemoteHandle) {
    let connector = ScriptedConnector::new();
    let remote = connector.push_success();
    let engine = NotificationEngine::with_parts(config(true, 3), Arc::new(connector.clone()), api).unwrap();
    let handle = engine.handle();
    wait_until(|| handle.status().is_connected()).await;
    (engine, connector, remote)
}

#[tokio::test(start_paused = true)]
async fn stale_replay_never_reverts_read() {
    let (engine, _connector, remote) = push_engine(Arc::new(MemoryApi::new())).await;
    let handle = engine.handle();

    let unread = json!({
        "type": "NEW_NOTIFICATION",
        "notification": {"id": 1, "title": "Due soon", "read": false, "createdAt": "2024-05-01T09:00:10Z"}
    });
    let read = json!({
        "type": "NEW_NOTIFICATION",
        "notification": {"id": 1, "title": "Due soon", "read": true,
                         "createdAt": "2024-05-01T09:00:10Z", "updatedAt": "2024-05-01T09:00:20Z"}
    });

    remote.deliver_json("/user/queue/notifications", unread.clone());
    wait_for_snapshot(&handle, |s| s.unread_count == 1).await;

    remote.deliver_json("/user/queue/notifications", read);
    wait_for_snapshot(&handle, |s| s.unread_count == 0).await;

    remote.deliver_json("/user/queue/notifications", unread);
    // Flush with a marker so the replay has certainly been processed.
    remote.deliver_json(
        "/user/queue/notifications",
        json!({"type": "NEW_NOTIFICATION", "notification": {"id": 2, "title": "marker", "read": true, "createdAt": "2024-05-01T08:00:00Z"}}),
    );
    let snapshot = wait_for_snapshot(&handle, |s| s.len() == 2).await;
    assert_eq!(snapshot.unread_count, 0);
    assert!(snapshot.get(&1.into()).unwrap().read);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fall_back_to_poll_until_manual_reconnect() {
    let api = Arc::new(MemoryApi::with_items(vec![note(1, false, 1)]));
    let connector = ScriptedConnector::new();
    for _ in 0..3 {
        connector.push_failure();
    }
    let engine = NotificationEngine::with_parts(config(true, 3), Arc::new(connector.clone()), api.clone()).unwrap();
    let handle = engine.handle();

    wait_until(|| handle.mode() == SchedulerMode::Poll).await;
    assert!(handle.status().is_terminal());
    assert_eq!(handle.status().failures, 3);
    assert_eq!(connector.attempts(), 3);

    // No fourth automatic attempt, while polling keeps the data flowing.
    let polls_before = api.calls().iter().filter(|c| *c == "unread_count").count();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 3);
    assert!(api.calls().iter().filter(|c| *c == "unread_count").count() > polls_before);

    connector.push_success();
    handle.reconnect();
    assert_eq!(handle.mode(), SchedulerMode::Push);
    wait_until(|| handle.status().is_connected()).await;
    assert_eq!(handle.status().failures, 0);
    assert_eq!(connector.attempts(), 4);

    // Polling stopped with the return to push.
    let polls_after = api.calls().iter().filter(|c| *c == "unread_count").count();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(api.calls().iter().filter(|c| *c == "unread_count").count(), polls_after);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_delays_double_up_to_ceiling() {
    let connector = ScriptedConnector::new();
    for _ in 0..8 {
        connector.push_failure();
    }
    let mut config = config(true, 8);
    config.reconnect.max_delay_ms = 10_000;
    let engine = NotificationEngine::with_parts(config, Arc::new(connector.clone()), Arc::new(MemoryApi::new())).unwrap();
    let handle = engine.handle();

    wait_until(|| handle.status().is_terminal()).await;
    let gaps: Vec<u64> = connector
        .attempt_times()
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect();
    assert_eq!(gaps, vec![1, 2, 4, 8, 10, 10, 10]);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disable_cancels_pending_reconnect() {
    let connector = ScriptedConnector::new();
    connector.push_failure();
    let engine = NotificationEngine::with_parts(config(true, 10), Arc::new(connector.clone()), Arc::new(MemoryApi::new())).unwrap();
    let handle = engine.handle();

    wait_until(|| handle.status().retry_in.is_some()).await;
    handle.scheduler().disable();
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(connector.attempts(), 1);
    assert_eq!(handle.mode(), SchedulerMode::Idle);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn only_one_transport_is_active() {
    // Push: no polling.
    let api = Arc::new(MemoryApi::new());
    let (engine, connector, _remote) = push_engine(api.clone()).await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(!api.calls().iter().any(|c| c == "unread_count"));
    assert_eq!(connector.attempts(), 1);
    engine.shutdown().await;

    // Poll: no channel.
    let api = Arc::new(MemoryApi::new());
    let connector = ScriptedConnector::new();
    let engine = NotificationEngine::with_parts(config(false, 3), Arc::new(connector.clone()), api.clone()).unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(connector.attempts(), 0);
    assert!(api.calls().iter().filter(|c| *c == "unread_count").count() >= 10);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn poll_mode_delivers_new_items() {
    let api = Arc::new(MemoryApi::with_items(vec![note(1, false, 1)]));
    let mut config = config(false, 3);
    config.realtime.poll_interval_ms = 2000;
    let engine = NotificationEngine::with_parts(config, Arc::new(ScriptedConnector::new()), api.clone()).unwrap();
    let handle = engine.handle();
    wait_for_snapshot(&handle, |s| s.len() == 1).await;

    api.insert(note(2, false, 2));
    let snapshot = wait_for_snapshot(&handle, |s| s.len() == 2).await;
    assert_eq!(snapshot.unread_count, 2);
    assert_eq!(snapshot.notifications[0].id, 2.into());
    engine.shutdown().await;
}

async fn next_alert(events: &mut broadcast::Receiver<PresentationEvent>) -> notify_sync::Alert {
    loop {
        match events.recv().await.unwrap() {
            PresentationEvent::Alert(alert) => return alert,
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn pushed_notifications_raise_alerts() {
    let (engine, _connector, remote) = push_engine(Arc::new(MemoryApi::new())).await;
    let mut events = engine.presenter().events();

    remote.deliver_json(
        "/user/queue/notifications",
        json!({"type": "NEW_NOTIFICATION", "notification": {"id": 5, "title": "Overdue", "type": "error", "createdAt": "2024-05-01T09:00:00Z"}}),
    );
    let alert = next_alert(&mut events).await;
    assert_eq!(alert.level, AlertLevel::Error);
    assert_eq!(alert.duration, Duration::from_millis(4500));

    remote.deliver_json(
        "/topic/notifications",
        json!({"type": "BROADCAST_NOTIFICATION", "notification": {"id": 6, "title": "Maintenance", "type": "system", "createdAt": "2024-05-01T09:05:00Z"}}),
    );
    let alert = next_alert(&mut events).await;
    assert_eq!(alert.level, AlertLevel::Warning);
    assert_eq!(alert.duration, Duration::from_secs(6));
    assert!(alert.notification.is_broadcast());

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connection_indicator_follows_status() {
    let connector = ScriptedConnector::new();
    let remote = connector.push_success();
    let engine = NotificationEngine::with_parts(config(true, 3), Arc::new(connector.clone()), Arc::new(MemoryApi::new())).unwrap();
    let presenter = engine.presenter();
    let mut events = presenter.events();

    let mut indicators = Vec::new();
    while indicators.last() != Some(&ConnectionIndicator::Live) {
        if let PresentationEvent::Connection(indicator) = events.recv().await.unwrap() {
            indicators.push(indicator);
        }
    }

    remote.close();
    loop {
        if let PresentationEvent::Connection(indicator) = events.recv().await.unwrap() {
            assert_eq!(indicator, ConnectionIndicator::Retrying { attempt: 1 });
            break;
        }
    }
    assert_eq!(presenter.connection(), ConnectionIndicator::Retrying { attempt: 1 });
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn click_marks_read_and_returns_link() {
    let mut item = note(1, false, 1);
    item.action_url = Some("/borrow/17".to_string());
    let api = Arc::new(MemoryApi::with_items(vec![item]));
    let engine = NotificationEngine::with_parts(config(false, 3), Arc::new(ScriptedConnector::new()), api.clone()).unwrap();
    let presenter = engine.presenter();
    let handle = engine.handle();

    let snapshot = wait_for_snapshot(&handle, |s| s.len() == 1).await;
    let link = presenter.handle_click(&snapshot.notifications[0]).await.unwrap();
    assert_eq!(link.as_deref(), Some("/borrow/17"));
    assert_eq!(handle.snapshot().await.unwrap().unread_count, 0);

    wait_until(|| api.items()[0].read).await;
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_startup_never_goes_live() {
    let connector = ScriptedConnector::new();
    connector.push_success();
    let api = Arc::new(MemoryApi::with_items(vec![note(1, false, 1)]));
    let engine = NotificationEngine::with_parts(config(true, 3), Arc::new(connector.clone()), api.clone()).unwrap();
    let handle = engine.handle();
    engine.shutdown().await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 0);
    assert_eq!(handle.mode(), SchedulerMode::Idle);
    assert!(!api.calls().iter().any(|c| c == "unread_count"));
}
