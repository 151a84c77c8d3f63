//! End-to-end scenarios: one controller and one client sharing a store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use rlk_core::activity::{
    ActivityEntry, ActivityError, ActivityKind, ActivityLog, ActivitySink, MemoryActivitySink,
};
use rlk_core::client::{Client, ClientConfig, ClientEvent};
use rlk_core::controller::{Controller, ControllerConfig, ControllerEvent};
use rlk_core::device::{LOCK_VIBRATION, UNLOCK_VIBRATION};
use rlk_core::harness::{
    drain_client, drain_controller, run_lock_cycle, DeviceCall, FlakyStore, RecordingDevice,
    DEFAULT_IDLE,
};
use rlk_core::model::paths;
use rlk_core::session::DisconnectReason;
use rlk_core::{InMemoryStore, LockState, SessionError, SessionStore, StoreError};

/// Sink that takes a while to accept each entry, like a slow disk.
struct SlowSink(Duration);

#[async_trait]
impl ActivitySink for SlowSink {
    async fn record(&self, _entry: &ActivityEntry) -> Result<(), ActivityError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

fn activity() -> (Arc<ActivityLog>, Arc<MemoryActivitySink>) {
    let (log, sink) = ActivityLog::with_memory(50);
    (Arc::new(log), sink)
}

async fn joined_pair<S: SessionStore + ?Sized>(
    store: Arc<S>,
) -> (
    Controller<S>,
    Client<S, RecordingDevice>,
    Arc<MemoryActivitySink>,
    Arc<MemoryActivitySink>,
) {
    let (ctl_log, ctl_sink) = activity();
    let (cli_log, cli_sink) = activity();
    let mut controller = Controller::new(store.clone(), ctl_log, ControllerConfig::default());
    let mut client = Client::new(store, RecordingDevice::new(), cli_log, ClientConfig::generate());

    controller.create_session().await.unwrap();
    let link = controller.share_link().unwrap();
    client.connect(&link).await.unwrap();

    drain_controller(&mut controller, DEFAULT_IDLE).await;
    drain_client(&mut client, DEFAULT_IDLE).await;
    drain_controller(&mut controller, DEFAULT_IDLE).await;

    (controller, client, ctl_sink, cli_sink)
}

#[tokio::test]
async fn test_full_lock_cycle() {
    let store = InMemoryStore::new_shared();
    let (log, _) = activity();
    let transcript = run_lock_cycle(store.clone(), log, DEFAULT_IDLE).await.unwrap();

    let states: Vec<(&str, &str, bool)> = transcript
        .steps
        .iter()
        .map(|s| (s.label, s.client_state.as_str(), s.overlay_visible))
        .collect();
    assert_eq!(
        states,
        vec![
            ("create", "no_session", false),
            ("join", "connected_unlocked", false),
            ("lock", "connected_locked", true),
            ("unlock", "connected_unlocked", false),
            ("end", "disconnected", false),
        ]
    );
    assert_eq!(transcript.steps[1].controller_state, "active_client_connected");
    assert_eq!(transcript.steps[4].controller_state, "ended");

    assert!(transcript
        .device_calls
        .contains(&DeviceCall::Vibrate(LOCK_VIBRATION.to_vec())));
    assert!(transcript
        .device_calls
        .contains(&DeviceCall::Vibrate(UNLOCK_VIBRATION.to_vec())));

    // Ending the session must not leave a resurrected stub behind.
    assert!(!store.exists(&transcript.session_id).await.unwrap());
    assert_eq!(store.listener_count().await, 0);
}

#[tokio::test]
async fn test_client_connect_triggers_welcome() {
    let store = InMemoryStore::new_shared();
    let (controller, client, ctl_sink, cli_sink) = joined_pair(store.clone()).await;

    assert_eq!(controller.state().name(), "active_client_connected");
    assert!(ctl_sink.contains(ActivityKind::Success, "Client phone connected").await);
    assert!(cli_sink.contains(ActivityKind::Info, "Controller: Connected to controller").await);
    assert!(controller.view().client_device.is_some());
    assert_eq!(client.state().name(), "connected_unlocked");
}

#[tokio::test]
async fn test_overlay_follows_last_lock_state() {
    let store = InMemoryStore::new_shared();
    let (mut controller, mut client, _, _) = joined_pair(store.clone()).await;

    // Several commands land before the client gets to run.
    controller.send_lock().await.unwrap();
    controller.send_unlock().await.unwrap();
    controller.send_lock().await.unwrap();
    drain_client(&mut client, DEFAULT_IDLE).await;

    assert!(client.is_locked());
    assert!(client.device().overlay_visible);
    assert!(client.device().input_suppressed);
    assert_eq!(
        store.read(&paths::lock_state(client.session_id().unwrap())).await.unwrap(),
        Some(json!("locked"))
    );

    controller.send_unlock().await.unwrap();
    drain_client(&mut client, DEFAULT_IDLE).await;
    assert!(!client.device().overlay_visible);
    assert!(!client.device().input_suppressed);
}

#[tokio::test]
async fn test_lock_without_client_leaves_log_untouched() {
    let store = InMemoryStore::new_shared();
    let (log, sink) = activity();
    let mut controller = Controller::new(store.clone(), log, ControllerConfig::default());
    let id = controller.create_session().await.unwrap();
    drain_controller(&mut controller, DEFAULT_IDLE).await;

    assert_eq!(
        controller.send_lock().await.unwrap_err(),
        SessionError::NoClientConnected
    );
    assert_eq!(
        store.read(&paths::lock_state(&id)).await.unwrap(),
        Some(json!("unlocked"))
    );
    assert_eq!(store.read(&paths::commands(&id)).await.unwrap(), None);
    assert!(sink.contains(ActivityKind::Error, "No client connected").await);
}

#[tokio::test]
async fn test_end_session_disconnects_client() {
    let store = InMemoryStore::new_shared();
    let (mut controller, mut client, _, cli_sink) = joined_pair(store.clone()).await;
    let id = controller.session_id().unwrap().to_string();

    controller.send_lock().await.unwrap();
    drain_client(&mut client, DEFAULT_IDLE).await;
    assert!(client.is_locked());

    controller.end_session().await.unwrap();
    let events = drain_client(&mut client, DEFAULT_IDLE).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::Disconnected(_))));
    assert!(!client.device().overlay_visible);
    assert!(client.session_id().is_none());
    assert!(!store.exists(&id).await.unwrap());
    assert!(cli_sink.contains(ActivityKind::Info, "Disconnected from session").await);
}

#[tokio::test]
async fn test_emergency_unlock_leaves_session() {
    let store = InMemoryStore::new_shared();
    let (mut controller, mut client, ctl_sink, _) = joined_pair(store.clone()).await;

    assert!(client.emergency_unlock().await.is_err());

    controller.send_lock().await.unwrap();
    drain_client(&mut client, DEFAULT_IDLE).await;
    client.emergency_unlock().await.unwrap();

    assert!(!client.device().overlay_visible);
    assert_eq!(
        client.state(),
        &rlk_core::session::ClientState::Disconnected {
            reason: DisconnectReason::EmergencyUnlock
        }
    );

    let events = drain_controller(&mut controller, DEFAULT_IDLE).await;
    assert!(events.contains(&ControllerEvent::ClientPresence { connected: false }));
    assert_eq!(controller.state().name(), "active_no_client");
    assert!(ctl_sink.contains(ActivityKind::Warning, "Client phone disconnected").await);
    // The controller's lock intent is untouched.
    assert_eq!(controller.lock_state(), LockState::Locked);
}

#[tokio::test]
async fn test_status_ended_disconnects_client() {
    let store = InMemoryStore::new_shared();
    let (controller, mut client, _, _) = joined_pair(store.clone()).await;
    let id = controller.session_id().unwrap().to_string();

    store.write(&paths::status(&id), json!("ended")).await.unwrap();
    let events = drain_client(&mut client, DEFAULT_IDLE).await;
    assert!(events.contains(&ClientEvent::Disconnected(DisconnectReason::SessionEnded)));
    assert_eq!(
        store.read(&paths::client_connected(&id)).await.unwrap(),
        Some(json!(false))
    );
}

#[tokio::test]
async fn test_write_failure_is_reported_not_fatal() {
    let store = Arc::new(FlakyStore::new(InMemoryStore::new()));
    let (mut controller, _client, ctl_sink, _) = joined_pair(store.clone()).await;

    store
        .fail_writes(Some(StoreError::WriteFailed("offline".into())))
        .await;
    let err = controller.send_lock().await.unwrap_err();
    assert!(matches!(err, SessionError::WriteFailed(_)));
    assert!(ctl_sink.contains(ActivityKind::Error, "Failed to set lock state").await);
    assert_eq!(controller.state().name(), "active_client_connected");

    store
        .fail_writes(Some(StoreError::PermissionDenied("rules".into())))
        .await;
    let err = controller.send_unlock().await.unwrap_err();
    assert_eq!(err.class(), rlk_core::errors::ErrorClass::PermissionDenied);

    store.fail_writes(None).await;
    controller.send_lock().await.unwrap();
}

#[tokio::test]
async fn test_device_permission_denied_is_logged() {
    let store = InMemoryStore::new_shared();
    let (mut controller, mut client, _, cli_sink) = joined_pair(store).await;
    client.device_mut().deny_notifications = true;
    client.device_mut().deny_vibration = true;

    controller.send_lock().await.unwrap();
    drain_client(&mut client, DEFAULT_IDLE).await;

    assert!(client.device().overlay_visible);
    assert!(cli_sink.contains(ActivityKind::Error, "Vibration failed").await);
    assert!(cli_sink.contains(ActivityKind::Warning, "Notification failed").await);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_retries_after_failure() {
    let store = Arc::new(FlakyStore::new(InMemoryStore::new()));
    let (log, _) = activity();
    let mut controller = Controller::new(store.clone(), log.clone(), ControllerConfig::default());
    let id = controller.create_session().await.unwrap();

    let config = ClientConfig {
        heartbeat_interval: Duration::from_secs(30),
        ..ClientConfig::generate()
    };
    let mut client = Client::new(store.clone(), RecordingDevice::new(), log, config);
    client.connect(&id).await.unwrap();

    async fn next_heartbeat(
        client: &mut Client<FlakyStore<InMemoryStore>, RecordingDevice>,
    ) -> bool {
        loop {
            if let Some(ClientEvent::Heartbeat { ok }) = client.next_event().await.unwrap() {
                return ok;
            }
        }
    }

    store
        .fail_writes(Some(StoreError::WriteFailed("offline".into())))
        .await;
    assert!(!next_heartbeat(&mut client).await);
    assert!(client.state().is_connected());

    store.fail_writes(None).await;
    assert!(next_heartbeat(&mut client).await);
    assert!(store.read(&paths::client_last_seen(&id)).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_auto_welcome_survives_competing_timer() {
    let store = InMemoryStore::new_shared();
    let mut log = ActivityLog::new();
    log.add_sink(Arc::new(SlowSink(Duration::from_secs(3))));
    let mut controller = Controller::new(store.clone(), Arc::new(log), ControllerConfig::default());
    let id = controller.create_session().await.unwrap();

    let mut client = Client::new(
        store.clone(),
        RecordingDevice::new(),
        Arc::new(ActivityLog::new()),
        ClientConfig::generate(),
    );
    client.connect(&id).await.unwrap();

    // A one-second ticker keeps firing while slow activity writes are pending.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    for _ in 0..20 {
        tokio::select! {
            biased;
            wake = controller.recv() => match wake {
                Some(wake) => {
                    controller.process(wake).await.unwrap();
                }
                None => break,
            },
            _ = ticker.tick() => {}
        }
    }

    assert_eq!(controller.state().name(), "active_client_connected");
    let commands = store.read(&paths::commands(&id)).await.unwrap().unwrap();
    let welcomes = commands
        .as_object()
        .unwrap()
        .values()
        .filter(|c| c["type"] == "welcome")
        .count();
    assert_eq!(welcomes, 1);
}

#[tokio::test]
async fn test_reload_session_from_second_controller() {
    let store = InMemoryStore::new_shared();
    let (controller, _client, _, _) = joined_pair(store.clone()).await;
    let link = controller.share_link().unwrap();

    let (log, _) = activity();
    let mut second = Controller::new(store, log, ControllerConfig::default());
    let record = second.load_session(&link).await.unwrap();
    assert!(record.client.connected);
    assert_eq!(second.state().name(), "active_client_connected");
    second.send_lock().await.unwrap();
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_lock_cycle_across_sqlite_handles() {
    use rlk_core::sqlite_store::SqliteStore;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("sessions.db");
    let poll = Duration::from_millis(20);

    let ctl_store = Arc::new(SqliteStore::new(&path).unwrap().with_poll_interval(poll));
    let cli_store = Arc::new(SqliteStore::new(&path).unwrap().with_poll_interval(poll));
    let (ctl_log, _) = activity();
    let (cli_log, _) = activity();

    let mut controller = Controller::new(ctl_store, ctl_log, ControllerConfig::default());
    let mut client = Client::new(cli_store, RecordingDevice::new(), cli_log, ClientConfig::generate());
    let idle = Duration::from_millis(200);

    let id = controller.create_session().await.unwrap();
    client.connect(&id).await.unwrap();
    drain_controller(&mut controller, idle).await;
    assert_eq!(controller.state().name(), "active_client_connected");

    controller.send_lock().await.unwrap();
    drain_client(&mut client, idle).await;
    assert!(client.device().overlay_visible);

    controller.end_session().await.unwrap();
    drain_client(&mut client, idle).await;
    assert!(!client.state().is_connected());
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_heartbeat_after_end_does_not_recreate_session() {
    use rlk_core::sqlite_store::SqliteStore;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("sessions.db");
    let ctl_store = Arc::new(
        SqliteStore::new(&path)
            .unwrap()
            .with_poll_interval(Duration::from_millis(20)),
    );
    // The client polls too slowly to notice the delete before its next heartbeat.
    let cli_store = Arc::new(
        SqliteStore::new(&path)
            .unwrap()
            .with_poll_interval(Duration::from_secs(60)),
    );
    let (ctl_log, _) = activity();
    let (cli_log, _) = activity();

    let mut controller = Controller::new(ctl_store.clone(), ctl_log, ControllerConfig::default());
    let mut client = Client::new(cli_store, RecordingDevice::new(), cli_log, ClientConfig::generate());

    let id = controller.create_session().await.unwrap();
    client.connect(&id).await.unwrap();
    controller.end_session().await.unwrap();
    assert!(!ctl_store.exists(&id).await.unwrap());

    assert!(!client.heartbeat().await);
    assert!(!ctl_store.exists(&id).await.unwrap());
    assert!(ctl_store.session_ids().await.unwrap().is_empty());
}
