//! Controller role: creates sessions, issues commands, observes the client.
//!
//! The controller owns the session record. It writes `lockState`, appends to
//! the command log and deletes the record when the session ends. Everything it
//! learns about the client comes from subscriptions on the same record.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::activity::ActivityLog;
use crate::errors::{validate_session_id, SessionError};
use crate::link;
use crate::model::{paths, Command, CommandPayload, DeviceInfo, LockState, SessionRecord, SessionSettings};
use crate::session::{ControllerEffect, ControllerMachine, ControllerState};
use crate::store::SessionStore;
use crate::types::{now_millis, random_base36};
use crate::watch::{StoreEvent, Subscription};

pub const DEFAULT_ORIGIN: &str = "http://localhost:8080";
pub const WELCOME_MESSAGE: &str = "Connected to controller";
/// `reason` of the `disconnect` command appended when a session ends.
pub const SESSION_ENDED_REASON: &str = "session_ended";

/// Generate a session id: `session_<ms>_<9 base36 chars>`.
pub fn generate_session_id() -> Result<String, SessionError> {
    let suffix = random_base36(9)
        .map_err(|e| SessionError::InvalidState(format!("entropy source unavailable: {e}")))?;
    Ok(format!("session_{}_{}", now_millis(), suffix))
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Origin share links are built against.
    pub origin: String,
    /// Identifier written to `controller.uid`.
    pub uid: String,
    /// Settings written into new sessions.
    pub settings: SessionSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            uid: format!("controller_{}", now_millis()),
            settings: SessionSettings::default(),
        }
    }
}

/// Something the controller observed on its session.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    ClientPresence { connected: bool },
    LockState(LockState),
    CommandLogged { key: String, command: Command },
    DeviceInfo(Option<DeviceInfo>),
    /// The store dropped a subscription; the controller detached from the session.
    Detached,
}

/// Details gathered from subscriptions, for display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerView {
    pub client_device: Option<DeviceInfo>,
    /// Timestamp of the latest `lock`/`unlock` in the log.
    pub last_lock_change: Option<i64>,
    pub commands_seen: usize,
}

/// Live subscriptions for the attached session.
struct Listeners {
    client_connected: Subscription,
    lock_state: Subscription,
    commands: Subscription,
    device_info: Subscription,
}

impl Listeners {
    fn ids(&self) -> [u64; 4] {
        [
            self.client_connected.id(),
            self.lock_state.id(),
            self.commands.id(),
            self.device_info.id(),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    ClientConnected,
    LockState,
    Commands,
    DeviceInfo,
}

/// An observation taken by [`Controller::recv`], not yet acted on.
#[derive(Debug)]
#[must_use = "an observation does nothing until passed to Controller::process"]
pub struct ControllerWake {
    source: Source,
    event: Option<StoreEvent>,
}

/// Controller role bound to one store.
pub struct Controller<S: SessionStore + ?Sized> {
    store: Arc<S>,
    activity: Arc<ActivityLog>,
    config: ControllerConfig,
    machine: ControllerMachine,
    listeners: Option<Listeners>,
    view: ControllerView,
}

impl<S: SessionStore + ?Sized> Controller<S> {
    pub fn new(store: Arc<S>, activity: Arc<ActivityLog>, config: ControllerConfig) -> Self {
        Self {
            store,
            activity,
            config,
            machine: ControllerMachine::new(),
            listeners: None,
            view: ControllerView::default(),
        }
    }

    pub fn state(&self) -> &ControllerState {
        self.machine.state()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.machine.state().session_id()
    }

    pub fn client_connected(&self) -> bool {
        self.machine.client_connected()
    }

    pub fn lock_state(&self) -> LockState {
        self.machine.lock_state()
    }

    pub fn view(&self) -> &ControllerView {
        &self.view
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Generate a new session and write its initial record.
    pub async fn create_session(&mut self) -> Result<String, SessionError> {
        let id = generate_session_id()?;
        let record = SessionRecord::new(&id, &self.config.uid, now_millis(), self.config.settings);

        if let Err(e) = self.store.write(&paths::session(&id), record.to_value()?).await {
            self.activity
                .error(format!("Failed to create session: {e}"))
                .await;
            return Err(e.into());
        }

        self.attach(&record).await?;
        info!(session_id = %id, "session created");
        self.activity.success(format!("Session created: {id}")).await;
        Ok(id)
    }

    /// Attach to an existing session by id or share link.
    pub async fn load_session(&mut self, input: &str) -> Result<SessionRecord, SessionError> {
        let id = link::parse_session_input(input)
            .ok_or_else(|| SessionError::InvalidSessionId(input.to_string()))?;
        validate_session_id(&id)?;

        let value = match self.store.read(&paths::session(&id)).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.activity.error(format!("Session {id} not found")).await;
                return Err(SessionError::NotFound(id));
            }
            Err(e) => {
                self.activity
                    .error(format!("Failed to load session {id}: {e}"))
                    .await;
                return Err(e.into());
            }
        };

        let record = SessionRecord::from_value(value)?;
        self.attach(&record).await?;
        info!(session_id = %id, client_connected = record.client.connected, "session loaded");
        self.activity.success(format!("Session loaded: {id}")).await;
        Ok(record)
    }

    /// Current record of the attached session.
    pub async fn snapshot(&self) -> Result<SessionRecord, SessionError> {
        let id = self.machine.active_session()?;
        match self.store.read(&paths::session(id)).await? {
            Some(value) => Ok(SessionRecord::from_value(value)?),
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    /// Tell the client the session is over, then delete the record.
    pub async fn end_session(&mut self) -> Result<(), SessionError> {
        let id = self.require_active().await?;

        let disconnect = CommandPayload::Disconnect {
            reason: Some(SESSION_ENDED_REASON.to_string()),
        };
        if let Err(e) = self.append_command(&id, disconnect).await {
            self.activity.error(format!("Failed to end session: {e}")).await;
            return Err(e);
        }

        if let Err(e) = self.store.delete(&paths::session(&id)).await {
            self.activity.error(format!("Failed to end session: {e}")).await;
            return Err(e.into());
        }

        self.detach().await;
        self.machine.close();
        self.view = ControllerView::default();
        info!(session_id = %id, "session ended");
        self.activity
            .info("Session ended. Client disconnected.")
            .await;
        Ok(())
    }

    /// Detach from the session without touching the record.
    pub async fn shutdown(&mut self) {
        self.detach().await;
        self.machine.reset();
        self.view = ControllerView::default();
    }

    pub fn share_link(&self) -> Result<String, SessionError> {
        let id = self.machine.active_session()?;
        Ok(link::build_share_link(&self.config.origin, id))
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Set `lockState = locked`, then append `lock`.
    ///
    /// Rejected without touching the store unless a client is connected.
    pub async fn send_lock(&mut self) -> Result<Command, SessionError> {
        let id = match self.machine.lockable_session() {
            Ok(id) => id.to_string(),
            Err(e) => {
                let message = match e {
                    SessionError::NoClientConnected => "No client connected. Connect a client first.",
                    _ => "No active session",
                };
                self.activity.error(message).await;
                return Err(e);
            }
        };

        self.write_lock_state(&id, LockState::Locked).await?;
        let command = self.append_command(&id, CommandPayload::Lock).await?;
        self.activity.command("Lock command sent to client").await;
        Ok(command)
    }

    /// Set `lockState = unlocked`, then append `unlock`.
    pub async fn send_unlock(&mut self) -> Result<Command, SessionError> {
        let id = self.require_active().await?;
        self.write_lock_state(&id, LockState::Unlocked).await?;
        let command = self.append_command(&id, CommandPayload::Unlock).await?;
        self.activity.command("Unlock command sent to client").await;
        Ok(command)
    }

    /// Append an arbitrary command. `lock`/`unlock` go through their own paths.
    pub async fn send_command(&mut self, payload: CommandPayload) -> Result<Command, SessionError> {
        match payload {
            CommandPayload::Lock => return self.send_lock().await,
            CommandPayload::Unlock => return self.send_unlock().await,
            _ => {}
        }

        let id = self.require_active().await?;
        let kind = payload.type_name().to_string();
        let command = self.append_command(&id, payload).await?;
        self.activity.command(format!("Sent {kind} command")).await;
        Ok(command)
    }

    async fn write_lock_state(&self, id: &str, state: LockState) -> Result<(), SessionError> {
        let mut fields = Map::new();
        fields.insert("lockState".to_string(), json!(state.as_str()));
        if let Err(e) = self.store.update(&paths::session(id), fields).await {
            self.activity
                .error(format!("Failed to set lock state to {state}: {e}"))
                .await;
            return Err(e.into());
        }
        debug!(session_id = %id, lock_state = %state, "lock state written");
        Ok(())
    }

    async fn append_command(&self, id: &str, payload: CommandPayload) -> Result<Command, SessionError> {
        let command = Command::new(payload, now_millis());
        match self.store.append(&paths::commands(id), command.to_value()?).await {
            Ok(key) => {
                debug!(session_id = %id, key = %key, kind = command.type_name(), "command appended");
                Ok(command)
            }
            Err(e) => {
                self.activity
                    .error(format!("Failed to send {} command: {e}", command.type_name()))
                    .await;
                Err(e.into())
            }
        }
    }

    async fn require_active(&self) -> Result<String, SessionError> {
        match self.machine.active_session() {
            Ok(id) => Ok(id.to_string()),
            Err(e) => {
                self.activity.error("No active session").await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    async fn attach(&mut self, record: &SessionRecord) -> Result<(), SessionError> {
        self.detach().await;

        let id = &record.id;
        // A partially opened set is released when the subscriptions drop.
        let listeners = Listeners {
            client_connected: self.store.subscribe(&paths::client_connected(id)).await?,
            lock_state: self.store.subscribe(&paths::lock_state(id)).await?,
            commands: self.store.subscribe_child_added(&paths::commands(id)).await?,
            device_info: self.store.subscribe(&paths::client_device_info(id)).await?,
        };

        self.machine.open(record);
        self.view = ControllerView {
            client_device: record.client.device_info.clone(),
            ..ControllerView::default()
        };
        self.listeners = Some(listeners);
        Ok(())
    }

    async fn detach(&mut self) {
        let Some(listeners) = self.listeners.take() else {
            return;
        };
        for id in listeners.ids() {
            if let Err(e) = self.store.unsubscribe(id).await {
                debug!(subscription = id, error = %e, "unsubscribe failed");
            }
        }
    }

    /// Wait for the next observation on the attached session without acting
    /// on it.
    ///
    /// Cancel-safe, so it may race stdin or signals in a `select!`. Hand the
    /// result to [`Controller::process`]. Returns `None` when no session is
    /// attached.
    pub async fn recv(&mut self) -> Option<ControllerWake> {
        let listeners = self.listeners.as_mut()?;
        let (source, event) = tokio::select! {
            biased;
            ev = listeners.client_connected.recv() => (Source::ClientConnected, ev),
            ev = listeners.lock_state.recv() => (Source::LockState, ev),
            ev = listeners.commands.recv() => (Source::Commands, ev),
            ev = listeners.device_info.recv() => (Source::DeviceInfo, ev),
        };
        Some(ControllerWake { source, event })
    }

    /// React to an observation taken by [`Controller::recv`].
    ///
    /// Effects (the automatic welcome, activity entries) run before this
    /// returns; await it to completion.
    pub async fn process(
        &mut self,
        wake: ControllerWake,
    ) -> Result<Option<ControllerEvent>, SessionError> {
        if self.listeners.is_none() {
            return Ok(None);
        }
        Ok(self.handle(wake.source, wake.event).await)
    }

    /// [`Controller::recv`] then [`Controller::process`] until an event is
    /// produced. Not cancel-safe.
    ///
    /// Returns `Ok(None)` when no session is attached.
    pub async fn next_event(&mut self) -> Result<Option<ControllerEvent>, SessionError> {
        loop {
            let Some(wake) = self.recv().await else {
                return Ok(None);
            };
            if let Some(event) = self.process(wake).await? {
                return Ok(Some(event));
            }
        }
    }

    async fn handle(&mut self, source: Source, event: Option<StoreEvent>) -> Option<ControllerEvent> {
        match (source, event) {
            (_, None) => {
                warn!(?source, "store closed a controller subscription");
                self.detach().await;
                self.machine.reset();
                self.activity.warning("Lost connection to the session store").await;
                Some(ControllerEvent::Detached)
            }
            (Source::ClientConnected, Some(StoreEvent::Value(value))) => {
                let connected = value.as_ref().and_then(Value::as_bool).unwrap_or(false);
                let effects = self.machine.observe_client_connected(connected);
                self.apply(effects).await;
                Some(ControllerEvent::ClientPresence { connected })
            }
            (Source::LockState, Some(StoreEvent::Value(value))) => {
                let state = value
                    .and_then(|v| serde_json::from_value::<LockState>(v).ok())
                    .unwrap_or_default();
                self.machine.observe_lock_state(state);
                Some(ControllerEvent::LockState(state))
            }
            (Source::Commands, Some(StoreEvent::ChildAdded { key, value })) => {
                match serde_json::from_value::<Command>(value) {
                    Ok(command) => {
                        self.view.commands_seen += 1;
                        if matches!(command.payload, CommandPayload::Lock | CommandPayload::Unlock) {
                            self.view.last_lock_change = Some(command.timestamp);
                        }
                        Some(ControllerEvent::CommandLogged { key, command })
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "skipping malformed command");
                        None
                    }
                }
            }
            (Source::DeviceInfo, Some(StoreEvent::Value(value))) => {
                let info = value.and_then(|v| serde_json::from_value::<DeviceInfo>(v).ok());
                self.view.client_device = info.clone();
                Some(ControllerEvent::DeviceInfo(info))
            }
            (_, Some(_)) => None,
        }
    }

    async fn apply(&mut self, effects: Vec<ControllerEffect>) {
        for effect in effects {
            match effect {
                ControllerEffect::SendWelcome => {
                    let welcome = CommandPayload::Welcome {
                        message: Some(WELCOME_MESSAGE.to_string()),
                    };
                    // Failure is already in the activity log.
                    let _ = self.send_command(welcome).await;
                }
                ControllerEffect::Log { kind, message } => {
                    self.activity.record(kind, message).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;
    use crate::store::InMemoryStore;

    fn controller(store: Arc<InMemoryStore>) -> (Controller<InMemoryStore>, Arc<crate::activity::MemoryActivitySink>) {
        let (log, sink) = ActivityLog::with_memory(50);
        (
            Controller::new(store, Arc::new(log), ControllerConfig::default()),
            sink,
        )
    }

    #[test]
    fn test_generate_session_id_format() {
        let id = generate_session_id().unwrap();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "session");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(validate_session_id(&id).is_ok());
    }

    #[tokio::test]
    async fn test_create_writes_initial_record() {
        let store = InMemoryStore::new_shared();
        let (mut ctl, _) = controller(store.clone());
        let id = ctl.create_session().await.unwrap();

        assert!(store.exists(&id).await.unwrap());
        assert_eq!(ctl.state().name(), "active_no_client");
        let record = ctl.snapshot().await.unwrap();
        assert_eq!(record.lock_state, LockState::Unlocked);
        assert!(record.controller.connected);
        assert!(!record.client.connected);
    }

    #[tokio::test]
    async fn test_load_existing_and_missing() {
        let store = InMemoryStore::new_shared();
        let (mut first, _) = controller(store.clone());
        let id = first.create_session().await.unwrap();

        let (mut second, sink) = controller(store.clone());
        let record = second.load_session(&id).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(second.session_id(), Some(id.as_str()));

        let (mut third, _) = controller(store);
        let link = first.share_link().unwrap();
        assert_eq!(third.load_session(&link).await.unwrap().id, id);

        let err = second.load_session("session_0_missing").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(sink.contains(ActivityKind::Error, "not found").await);
    }

    #[tokio::test]
    async fn test_lock_without_client_is_rejected() {
        let store = InMemoryStore::new_shared();
        let (mut ctl, sink) = controller(store.clone());
        let id = ctl.create_session().await.unwrap();
        let before = store.dump().await;

        let err = ctl.send_lock().await.unwrap_err();
        assert_eq!(err, SessionError::NoClientConnected);
        assert_eq!(store.dump().await, before);
        assert_eq!(store.read(&paths::commands(&id)).await.unwrap(), None);
        assert!(sink.contains(ActivityKind::Error, "No client connected").await);
    }

    #[tokio::test]
    async fn test_unlock_needs_only_active_session() {
        let store = InMemoryStore::new_shared();
        let (mut ctl, _) = controller(store.clone());
        assert_eq!(ctl.send_unlock().await.unwrap_err(), SessionError::NoActiveSession);

        let id = ctl.create_session().await.unwrap();
        let cmd = ctl.send_unlock().await.unwrap();
        assert_eq!(cmd.type_name(), "unlock");
        assert!(store.read(&paths::commands(&id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_welcome_sent_when_client_connects() {
        let store = InMemoryStore::new_shared();
        let (mut ctl, _) = controller(store.clone());
        let id = ctl.create_session().await.unwrap();

        // Initial values for the four subscriptions.
        for _ in 0..3 {
            ctl.next_event().await.unwrap();
        }

        store
            .write(&paths::client_connected(&id), json!(true))
            .await
            .unwrap();
        let event = ctl.next_event().await.unwrap();
        assert_eq!(event, Some(ControllerEvent::ClientPresence { connected: true }));
        assert_eq!(ctl.state().name(), "active_client_connected");

        let event = ctl.next_event().await.unwrap();
        match event {
            Some(ControllerEvent::CommandLogged { command, .. }) => {
                assert_eq!(
                    command.payload,
                    CommandPayload::Welcome {
                        message: Some(WELCOME_MESSAGE.into())
                    }
                );
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_session_deletes_record() {
        let store = InMemoryStore::new_shared();
        let (mut ctl, _) = controller(store.clone());
        let id = ctl.create_session().await.unwrap();

        ctl.end_session().await.unwrap();
        assert!(!store.exists(&id).await.unwrap());
        assert_eq!(ctl.state().name(), "ended");
        assert_eq!(store.listener_count().await, 0);
        assert_eq!(ctl.next_event().await.unwrap(), None);
        assert!(ctl.share_link().is_err());
    }
}
