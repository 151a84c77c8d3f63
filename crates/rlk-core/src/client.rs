//! Client role: joins a session, mirrors `lockState` onto the device, reports
//! presence and executes inbound commands.
//!
//! Everything the client knows about the session lives in a context object
//! built on connect and dropped on disconnect. Listeners are detached before
//! the context is cleared.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::activity::{ActivityKind, ActivityLog};
use crate::device::DeviceHooks;
use crate::errors::{validate_session_id, SessionError};
use crate::link;
use crate::model::{paths, Command, CommandPayload, LockState, SessionRecord, SessionStatus};
use crate::session::{ClientEffect, ClientMachine, ClientState, DisconnectReason};
use crate::store::{SessionStore, StoreError};
use crate::types::{now_millis, random_base36};
use crate::watch::{StoreEvent, Subscription};

/// Interval between `client.lastSeen` writes.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Written to `client.clientId` and the `client_connected` command.
    pub client_id: String,
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    /// Config with a freshly generated client id.
    pub fn generate() -> Self {
        let suffix = random_base36(9).unwrap_or_else(|_| "local".to_string());
        Self {
            client_id: format!("client_{}_{}", now_millis(), suffix),
            heartbeat_interval: DEFAULT_HEARTBEAT,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::generate()
    }
}

/// Something the client observed or did.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// `lockState` was observed; `locked` is the resulting device state.
    LockState { locked: bool },
    /// `status` was observed.
    Status(Option<SessionStatus>),
    /// A command appended after join was executed.
    Command(Command),
    /// A heartbeat write was attempted.
    Heartbeat { ok: bool },
    /// The client left the session.
    Disconnected(DisconnectReason),
}

/// Per-session state, alive between connect and disconnect.
struct ClientContext {
    session_id: String,
    lock_state: Subscription,
    commands: Subscription,
    status: Subscription,
    heartbeat: Interval,
    /// Command keys already in the log at join; not executed.
    history: HashSet<String>,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    LockState,
    Commands,
    Status,
}

#[derive(Debug)]
enum Wake {
    Store(Source, Option<StoreEvent>),
    Heartbeat,
}

/// A wakeup taken by [`Client::recv`], not yet acted on.
#[derive(Debug)]
#[must_use = "a wakeup does nothing until passed to Client::process"]
pub struct ClientWake(Wake);

/// Client role bound to one store and one device.
pub struct Client<S: SessionStore + ?Sized, D: DeviceHooks> {
    store: Arc<S>,
    device: D,
    activity: Arc<ActivityLog>,
    config: ClientConfig,
    machine: ClientMachine,
    context: Option<ClientContext>,
}

impl<S: SessionStore + ?Sized, D: DeviceHooks> Client<S, D> {
    pub fn new(store: Arc<S>, device: D, activity: Arc<ActivityLog>, config: ClientConfig) -> Self {
        Self {
            store,
            device,
            activity,
            config,
            machine: ClientMachine::new(),
            context: None,
        }
    }

    pub fn state(&self) -> &ClientState {
        self.machine.state()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.session_id.as_str())
    }

    pub fn is_locked(&self) -> bool {
        self.machine.state().is_locked()
    }

    /// Time spent locked so far, while locked.
    pub fn locked_for(&self, now: i64) -> Option<Duration> {
        self.machine
            .locked_since()
            .map(|since| Duration::from_millis(now.saturating_sub(since).max(0) as u64))
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    // ------------------------------------------------------------------------
    // Connect / disconnect
    // ------------------------------------------------------------------------

    /// Join a session by id or share link.
    ///
    /// On failure the client is back in `no_session` with nothing subscribed.
    pub async fn connect(&mut self, input: &str) -> Result<ClientState, SessionError> {
        let session_id = match link::parse_session_input(input) {
            Some(id) => id,
            None => {
                self.activity.error("Please enter a session ID").await;
                return Err(SessionError::InvalidSessionId(input.to_string()));
            }
        };
        if let Err(e) = validate_session_id(&session_id) {
            self.activity.error(format!("Invalid session ID: {session_id}")).await;
            return Err(e);
        }

        self.machine.begin_connect(&session_id)?;
        info!(session_id = %session_id, "connecting");

        match self.join(&session_id).await {
            Ok((context, record)) => {
                self.context = Some(context);
                let effects = self.machine.joined(&record, now_millis());
                self.activity
                    .success(format!("Connected to session: {session_id}"))
                    .await;
                self.apply(effects).await;
                Ok(self.state().clone())
            }
            Err(e) => {
                self.machine.connect_failed();
                let message = match &e {
                    SessionError::NotFound(_) => "Session not found".to_string(),
                    other => format!("Connection failed: {other}"),
                };
                self.activity.error(message).await;
                Err(e)
            }
        }
    }

    async fn join(&self, session_id: &str) -> Result<(ClientContext, SessionRecord), SessionError> {
        let value = self
            .store
            .read(&paths::session(session_id))
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let record = SessionRecord::from_value(value)?;

        if record.status == SessionStatus::Ended {
            return Err(SessionError::InvalidState(format!(
                "session {session_id} has ended"
            )));
        }
        if record.client.connected {
            warn!(session_id, previous = ?record.client.client_id, "another client is marked connected");
            self.activity
                .warning("Another client was connected; taking over")
                .await;
        }

        let now = now_millis();
        let device = self.device.device_info();
        let mut presence = Map::new();
        presence.insert("connected".into(), json!(true));
        presence.insert("lastSeen".into(), json!(now));
        presence.insert("deviceInfo".into(), serde_json::to_value(&device)?);
        presence.insert("clientId".into(), json!(self.config.client_id));
        presence.insert("disconnectedAt".into(), Value::Null);
        self.store
            .update(&paths::client(session_id), presence)
            .await?;

        // Dropped subscriptions detach themselves if a later step fails.
        let lock_state = self.store.subscribe(&paths::lock_state(session_id)).await?;
        let commands = self
            .store
            .subscribe_child_added(&paths::commands(session_id))
            .await?;
        let status = self.store.subscribe(&paths::status(session_id)).await?;

        let announce = Command::new(
            CommandPayload::ClientConnected {
                client_id: Some(self.config.client_id.clone()),
                device: Some(device),
            },
            now,
        );
        if let Err(e) = self
            .store
            .append(&paths::commands(session_id), announce.to_value()?)
            .await
        {
            warn!(session_id, error = %e, "could not announce client");
        }

        let period = self.config.heartbeat_interval.max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let context = ClientContext {
            session_id: session_id.to_string(),
            lock_state,
            commands,
            status,
            heartbeat,
            history: record.commands.keys().cloned().collect(),
        };
        Ok((context, record))
    }

    /// Leave the session. Releases the overlay if locked.
    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.context.is_none() {
            return Err(SessionError::NoActiveSession);
        }
        let effects = self
            .machine
            .leave(DisconnectReason::UserRequested, now_millis());
        self.apply(effects).await;
        Ok(())
    }

    /// Release a locked device locally and leave the session.
    pub async fn emergency_unlock(&mut self) -> Result<(), SessionError> {
        let effects = self.machine.emergency_unlock(now_millis())?;
        self.apply(effects).await;
        Ok(())
    }

    /// Write `client.lastSeen`. Failures are left for the next tick.
    ///
    /// Returns `false` when the write failed or the session record is gone.
    pub async fn heartbeat(&self) -> bool {
        match self.beat().await {
            Ok(written) => written,
            Err(e) => {
                debug!(session_id = ?self.session_id(), error = %e, "heartbeat failed, retrying next tick");
                false
            }
        }
    }

    /// `Ok(false)` when the record no longer exists. Never recreates it.
    async fn beat(&self) -> Result<bool, StoreError> {
        let Some(context) = self.context.as_ref() else {
            return Ok(false);
        };
        self.store
            .write_if_present(&paths::client_last_seen(&context.session_id), json!(now_millis()))
            .await
    }

    async fn on_heartbeat(&mut self) -> Option<ClientEvent> {
        match self.beat().await {
            Ok(true) => Some(ClientEvent::Heartbeat { ok: true }),
            Ok(false) => {
                warn!(session_id = ?self.session_id(), "session record gone at heartbeat");
                let effects = self
                    .machine
                    .leave(DisconnectReason::SessionDeleted, now_millis());
                self.apply(effects).await.map(ClientEvent::Disconnected)
            }
            Err(e) => {
                debug!(session_id = ?self.session_id(), error = %e, "heartbeat failed, retrying next tick");
                Some(ClientEvent::Heartbeat { ok: false })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------------

    /// Wait for the next observation or heartbeat tick without acting on it.
    ///
    /// Cancel-safe: dropping the future consumes nothing, so it may race
    /// other branches of a `select!`. Hand the result to [`Client::process`].
    /// Returns `None` when not connected.
    pub async fn recv(&mut self) -> Option<ClientWake> {
        let context = self.context.as_mut()?;
        let wake = tokio::select! {
            biased;
            ev = context.commands.recv() => Wake::Store(Source::Commands, ev),
            ev = context.lock_state.recv() => Wake::Store(Source::LockState, ev),
            ev = context.status.recv() => Wake::Store(Source::Status, ev),
            _ = context.heartbeat.tick() => Wake::Heartbeat,
        };
        Some(ClientWake(wake))
    }

    /// React to a wakeup taken by [`Client::recv`].
    ///
    /// Runs the resulting device effects and store writes in order. Await it
    /// to completion; racing it against other futures can strand the overlay.
    /// Returns `Ok(None)` when the wakeup had no visible outcome.
    pub async fn process(&mut self, wake: ClientWake) -> Result<Option<ClientEvent>, SessionError> {
        if self.context.is_none() {
            return Ok(None);
        }
        let event = match wake.0 {
            Wake::Heartbeat => self.on_heartbeat().await,
            Wake::Store(source, event) => self.handle(source, event).await,
        };
        Ok(event)
    }

    /// [`Client::recv`] then [`Client::process`] until something visible
    /// happens. Not cancel-safe; use the two halves inside `select!`.
    ///
    /// Returns `Ok(None)` when not connected.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>, SessionError> {
        loop {
            let Some(wake) = self.recv().await else {
                return Ok(None);
            };
            if let Some(event) = self.process(wake).await? {
                return Ok(Some(event));
            }
        }
    }

    async fn handle(&mut self, source: Source, event: Option<StoreEvent>) -> Option<ClientEvent> {
        let now = now_millis();
        let effects = match (source, event) {
            (_, None) => {
                warn!(?source, "store closed a client subscription");
                self.machine.leave(DisconnectReason::ConnectionLost, now)
            }
            (Source::LockState, Some(StoreEvent::Value(value))) => {
                let state = match value {
                    None => None,
                    Some(v) => match serde_json::from_value::<LockState>(v.clone()) {
                        Ok(state) => Some(state),
                        Err(_) => {
                            warn!(value = %v, "ignoring unrecognised lockState");
                            return None;
                        }
                    },
                };
                let effects = self.machine.observe_lock_state(state, now);
                if let Some(reason) = self.apply(effects).await {
                    return Some(ClientEvent::Disconnected(reason));
                }
                return Some(ClientEvent::LockState {
                    locked: self.is_locked(),
                });
            }
            (Source::Status, Some(StoreEvent::Value(value))) => {
                let status = value.and_then(|v| serde_json::from_value::<SessionStatus>(v).ok());
                let effects = self.machine.observe_status(status, now);
                if let Some(reason) = self.apply(effects).await {
                    return Some(ClientEvent::Disconnected(reason));
                }
                return Some(ClientEvent::Status(status));
            }
            (Source::Commands, Some(StoreEvent::ChildAdded { key, value })) => {
                let is_history = self
                    .context
                    .as_ref()
                    .map(|c| c.history.contains(&key))
                    .unwrap_or(true);
                if is_history {
                    return None;
                }
                let command = match serde_json::from_value::<Command>(value) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(key = %key, error = %e, "skipping malformed command");
                        return None;
                    }
                };
                debug!(key = %key, kind = command.type_name(), "command received");
                let effects = self.machine.observe_command(&command, now);
                if let Some(reason) = self.apply(effects).await {
                    return Some(ClientEvent::Disconnected(reason));
                }
                return Some(ClientEvent::Command(command));
            }
            (_, Some(_)) => return None,
        };

        self.apply(effects)
            .await
            .map(ClientEvent::Disconnected)
    }

    /// Execute machine effects. Returns the reason if the session was torn down.
    async fn apply(&mut self, effects: Vec<ClientEffect>) -> Option<DisconnectReason> {
        let mut torn_down = None;
        for effect in effects {
            match effect {
                ClientEffect::ShowOverlay => {
                    let session_id = self.session_id().unwrap_or_default().to_string();
                    self.device.show_overlay(&session_id);
                }
                ClientEffect::HideOverlay => self.device.hide_overlay(),
                ClientEffect::SuppressInput => self.device.suppress_input(),
                ClientEffect::RestoreInput => self.device.restore_input(),
                ClientEffect::Vibrate(pattern) => {
                    if let Err(e) = self.device.vibrate(pattern) {
                        self.activity.error(format!("Vibration failed: {e}")).await;
                    }
                }
                ClientEffect::PlayTone(tone) => {
                    if let Err(e) = self.device.play_tone(tone) {
                        self.activity.error(format!("Sound failed: {e}")).await;
                    }
                }
                ClientEffect::Notify { title, body } => {
                    if let Err(e) = self.device.notify(title, body) {
                        self.activity
                            .record(ActivityKind::Warning, format!("Notification failed: {e}"))
                            .await;
                    }
                }
                ClientEffect::Log { kind, message } => self.activity.record(kind, message).await,
                ClientEffect::Teardown(reason) => {
                    self.teardown(&reason).await;
                    torn_down = Some(reason);
                }
            }
        }
        torn_down
    }

    async fn teardown(&mut self, reason: &DisconnectReason) {
        let Some(context) = self.context.take() else {
            return;
        };
        let ClientContext {
            session_id,
            lock_state,
            commands,
            status,
            heartbeat,
            ..
        } = context;

        // Heartbeat stops with the context.
        drop(heartbeat);
        for sub in [&lock_state, &commands, &status] {
            if let Err(e) = self.store.unsubscribe(sub.id()).await {
                debug!(subscription = sub.id(), error = %e, "unsubscribe failed");
            }
        }

        // Writing into a deleted record would recreate it.
        let still_there = !matches!(reason, DisconnectReason::SessionDeleted)
            && self.store.exists(&session_id).await.unwrap_or(false);
        if still_there {
            let mut presence = Map::new();
            presence.insert("connected".into(), json!(false));
            presence.insert("disconnectedAt".into(), json!(now_millis()));
            if let Err(e) = self.store.update(&paths::client(&session_id), presence).await {
                debug!(session_id = %session_id, error = %e, "could not clear presence");
            }
        }

        info!(session_id = %session_id, reason = %reason, "disconnected");
        self.activity.info("Disconnected from session").await;
    }
}
