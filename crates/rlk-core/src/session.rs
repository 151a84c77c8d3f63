//! Session state machines for the client and controller roles.
//!
//! Neither role writes its phase to the session record. Each keeps the latest
//! values it has observed for the fields it watches plus a local link phase,
//! and recomputes its state from those on every update. Side effects are
//! derived from the difference between the previous and the next state, so
//! observing the same value twice produces no effects.
//!
//! The machines are synchronous and perform no I/O; the role types in
//! [`crate::client`] and [`crate::controller`] execute the returned effects.

use std::fmt;

use crate::activity::ActivityKind;
use crate::device::{
    Tone, LOCK_NOTICE_BODY, LOCK_NOTICE_TITLE, LOCK_TONE, LOCK_VIBRATION, TEST_NOTICE_BODY,
    TEST_NOTICE_TITLE, TEST_TONE, TEST_VIBRATION, UNLOCK_VIBRATION,
};
use crate::errors::SessionError;
use crate::model::{
    Command, CommandPayload, LockState, SessionRecord, SessionSettings, SessionStatus, TestKind,
};

// ============================================================================
// Disconnect Reason
// ============================================================================

/// Why a client left its session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local user disconnected.
    UserRequested,
    /// The local user performed an emergency unlock.
    EmergencyUnlock,
    /// The controller sent a `disconnect` command.
    Commanded(Option<String>),
    /// The record's `status` became `ended`.
    SessionEnded,
    /// The session record was deleted.
    SessionDeleted,
    /// The store stopped delivering updates.
    ConnectionLost,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UserRequested => write!(f, "user_requested"),
            DisconnectReason::EmergencyUnlock => write!(f, "emergency_unlock"),
            DisconnectReason::Commanded(Some(reason)) => write!(f, "commanded: {}", reason),
            DisconnectReason::Commanded(None) => write!(f, "commanded"),
            DisconnectReason::SessionEnded => write!(f, "session_ended"),
            DisconnectReason::SessionDeleted => write!(f, "session_deleted"),
            DisconnectReason::ConnectionLost => write!(f, "connection_lost"),
        }
    }
}

// ============================================================================
// Client State Machine
// ============================================================================

/// Client projection of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    NoSession,
    Connecting { session_id: String },
    ConnectedUnlocked { session_id: String },
    ConnectedLocked { session_id: String },
    Disconnected { reason: DisconnectReason },
}

impl ClientState {
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::NoSession => "no_session",
            ClientState::Connecting { .. } => "connecting",
            ClientState::ConnectedUnlocked { .. } => "connected_unlocked",
            ClientState::ConnectedLocked { .. } => "connected_locked",
            ClientState::Disconnected { .. } => "disconnected",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientState::Connecting { session_id }
            | ClientState::ConnectedUnlocked { session_id }
            | ClientState::ConnectedLocked { session_id } => Some(session_id),
            ClientState::NoSession | ClientState::Disconnected { .. } => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ClientState::ConnectedUnlocked { .. } | ClientState::ConnectedLocked { .. }
        )
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, ClientState::ConnectedLocked { .. })
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side effect requested by the client machine.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEffect {
    ShowOverlay,
    HideOverlay,
    SuppressInput,
    RestoreInput,
    Vibrate(&'static [u32]),
    PlayTone(Tone),
    Notify {
        title: &'static str,
        body: &'static str,
    },
    Log {
        kind: ActivityKind,
        message: String,
    },
    /// Detach listeners, report presence and drop the session context.
    Teardown(DisconnectReason),
}

/// Local phase of the client link; not observable in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ClientLink {
    Idle,
    Joining { session_id: String },
    Joined { session_id: String },
    Left { reason: DisconnectReason },
}

/// Client session state machine.
#[derive(Clone, Debug)]
pub struct ClientMachine {
    link: ClientLink,
    lock_state: Option<LockState>,
    status: Option<SessionStatus>,
    settings: SessionSettings,
    state: ClientState,
    locked_since: Option<i64>,
}

impl Default for ClientMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMachine {
    pub fn new() -> Self {
        Self {
            link: ClientLink::Idle,
            lock_state: None,
            status: None,
            settings: SessionSettings::default(),
            state: ClientState::NoSession,
            locked_since: None,
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// When the current lock began (Unix ms), while locked.
    pub fn locked_since(&self) -> Option<i64> {
        self.locked_since
    }

    /// `no_session`/`disconnected` -> `connecting`.
    pub fn begin_connect(&mut self, session_id: &str) -> Result<(), SessionError> {
        match self.link {
            ClientLink::Idle | ClientLink::Left { .. } => {}
            _ => {
                return Err(SessionError::InvalidState(format!(
                    "cannot connect while {}",
                    self.state.name()
                )))
            }
        }
        self.link = ClientLink::Joining {
            session_id: session_id.to_string(),
        };
        self.lock_state = None;
        self.status = None;
        self.settings = SessionSettings::default();
        self.locked_since = None;
        self.state = self.project();
        Ok(())
    }

    /// `connecting` -> `no_session` after a failed join.
    pub fn connect_failed(&mut self) {
        if matches!(self.link, ClientLink::Joining { .. }) {
            self.link = ClientLink::Idle;
            self.state = self.project();
        }
    }

    /// `connecting` -> `connected_*`, seeded from the record read at join time.
    pub fn joined(&mut self, record: &SessionRecord, now: i64) -> Vec<ClientEffect> {
        let ClientLink::Joining { session_id } = &self.link else {
            return Vec::new();
        };
        self.link = ClientLink::Joined {
            session_id: session_id.clone(),
        };
        self.lock_state = Some(record.lock_state);
        self.status = Some(record.status);
        self.settings = record.settings;
        self.reproject(now)
    }

    pub fn observe_lock_state(&mut self, value: Option<LockState>, now: i64) -> Vec<ClientEffect> {
        if !self.is_joined() {
            return Vec::new();
        }
        self.lock_state = value;
        self.reproject(now)
    }

    pub fn observe_status(&mut self, value: Option<SessionStatus>, now: i64) -> Vec<ClientEffect> {
        if !self.is_joined() {
            return Vec::new();
        }
        self.status = value;
        self.reproject(now)
    }

    pub fn observe_settings(&mut self, settings: SessionSettings) {
        if self.is_joined() {
            self.settings = settings;
        }
    }

    /// React to a command appended after the client joined.
    pub fn observe_command(&mut self, command: &Command, now: i64) -> Vec<ClientEffect> {
        if !self.is_joined() {
            return Vec::new();
        }

        match &command.payload {
            // Lock state is driven by the `lockState` field; the log entry is history.
            CommandPayload::Lock | CommandPayload::Unlock => Vec::new(),
            CommandPayload::ClientConnected { .. } => Vec::new(),
            CommandPayload::Welcome { message } => vec![log(
                ActivityKind::Info,
                format!("Controller: {}", message.as_deref().unwrap_or("Welcome")),
            )],
            CommandPayload::Disconnect { reason } => {
                let mut effects = vec![log(
                    ActivityKind::Warning,
                    format!(
                        "Disconnected by controller ({})",
                        reason.as_deref().unwrap_or("no reason given")
                    ),
                )];
                effects.extend(self.leave(DisconnectReason::Commanded(reason.clone()), now));
                effects
            }
            CommandPayload::Test { kind: Some(kind) } => {
                let mut effects = test_effects(*kind);
                effects.push(log(
                    ActivityKind::Info,
                    format!("Test {} triggered", kind.as_str()),
                ));
                effects
            }
            CommandPayload::Test { kind: None } => vec![log(
                ActivityKind::Warning,
                "Test command without a recognised type",
            )],
            CommandPayload::Unknown { kind, .. } => {
                vec![log(ActivityKind::Info, format!("Received command: {kind}"))]
            }
        }
    }

    /// Leave the session locally.
    pub fn leave(&mut self, reason: DisconnectReason, now: i64) -> Vec<ClientEffect> {
        if !matches!(
            self.link,
            ClientLink::Joining { .. } | ClientLink::Joined { .. }
        ) {
            return Vec::new();
        }
        self.link = ClientLink::Left {
            reason: reason.clone(),
        };
        let mut effects = self.reproject(now);
        effects.push(ClientEffect::Teardown(reason));
        effects
    }

    /// Release the lock locally and leave. Only valid while locked.
    pub fn emergency_unlock(&mut self, now: i64) -> Result<Vec<ClientEffect>, SessionError> {
        if !self.state.is_locked() {
            return Err(SessionError::InvalidState(format!(
                "emergency unlock needs a locked device, state is {}",
                self.state.name()
            )));
        }
        let mut effects = vec![log(ActivityKind::Warning, "Emergency unlock activated")];
        effects.extend(self.leave(DisconnectReason::EmergencyUnlock, now));
        Ok(effects)
    }

    fn is_joined(&self) -> bool {
        matches!(self.link, ClientLink::Joined { .. })
    }

    fn project(&self) -> ClientState {
        match &self.link {
            ClientLink::Idle => ClientState::NoSession,
            ClientLink::Joining { session_id } => ClientState::Connecting {
                session_id: session_id.clone(),
            },
            ClientLink::Left { reason } => ClientState::Disconnected {
                reason: reason.clone(),
            },
            ClientLink::Joined { session_id } => match self.status {
                None => ClientState::Disconnected {
                    reason: DisconnectReason::SessionDeleted,
                },
                Some(SessionStatus::Ended) => ClientState::Disconnected {
                    reason: DisconnectReason::SessionEnded,
                },
                Some(SessionStatus::Active) => {
                    if self.lock_state == Some(LockState::Locked) {
                        ClientState::ConnectedLocked {
                            session_id: session_id.clone(),
                        }
                    } else {
                        ClientState::ConnectedUnlocked {
                            session_id: session_id.clone(),
                        }
                    }
                }
            },
        }
    }

    fn reproject(&mut self, now: i64) -> Vec<ClientEffect> {
        let next = self.project();
        let prev = std::mem::replace(&mut self.state, next.clone());
        let mut effects = Vec::new();

        match (prev.is_locked(), next.is_locked()) {
            (false, true) => {
                self.locked_since = Some(now);
                effects.extend(lock_effects(&self.settings));
            }
            (true, false) => {
                self.locked_since = None;
                effects.push(ClientEffect::HideOverlay);
                effects.push(ClientEffect::RestoreInput);
                if next.is_connected() {
                    effects.push(ClientEffect::Vibrate(UNLOCK_VIBRATION));
                    effects.push(log(ActivityKind::Success, "Phone unlocked by controller"));
                }
            }
            _ => {}
        }

        // The record ended or vanished underneath a joined client.
        if let (ClientLink::Joined { .. }, ClientState::Disconnected { reason }) =
            (&self.link, &next)
        {
            let reason = reason.clone();
            self.link = ClientLink::Left {
                reason: reason.clone(),
            };
            effects.push(log(
                ActivityKind::Warning,
                match reason {
                    DisconnectReason::SessionDeleted => "Session was removed",
                    _ => "Session ended by controller",
                },
            ));
            effects.push(ClientEffect::Teardown(reason));
        }

        effects
    }
}

fn log(kind: ActivityKind, message: impl Into<String>) -> ClientEffect {
    ClientEffect::Log {
        kind,
        message: message.into(),
    }
}

fn lock_effects(settings: &SessionSettings) -> Vec<ClientEffect> {
    let mut effects = vec![ClientEffect::ShowOverlay, ClientEffect::SuppressInput];
    if settings.vibrate_on_lock {
        effects.push(ClientEffect::Vibrate(LOCK_VIBRATION));
    }
    if settings.sound_on_lock {
        effects.push(ClientEffect::PlayTone(LOCK_TONE));
    }
    effects.push(ClientEffect::Notify {
        title: LOCK_NOTICE_TITLE,
        body: LOCK_NOTICE_BODY,
    });
    effects.push(log(ActivityKind::Warning, "Phone locked by controller"));
    effects
}

fn test_effects(kind: TestKind) -> Vec<ClientEffect> {
    match kind {
        TestKind::Vibration => vec![ClientEffect::Vibrate(TEST_VIBRATION)],
        TestKind::Sound => vec![ClientEffect::PlayTone(TEST_TONE)],
        TestKind::Notification => vec![ClientEffect::Notify {
            title: TEST_NOTICE_TITLE,
            body: TEST_NOTICE_BODY,
        }],
    }
}

// ============================================================================
// Controller State Machine
// ============================================================================

/// Controller projection of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerState {
    NoSession,
    ActiveNoClient { session_id: String },
    ActiveClientConnected { session_id: String },
    /// Terminal for this session; a new one may be generated.
    Ended { session_id: String },
}

impl ControllerState {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::NoSession => "no_session",
            ControllerState::ActiveNoClient { .. } => "active_no_client",
            ControllerState::ActiveClientConnected { .. } => "active_client_connected",
            ControllerState::Ended { .. } => "ended",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ControllerState::ActiveNoClient { session_id }
            | ControllerState::ActiveClientConnected { session_id } => Some(session_id),
            ControllerState::NoSession | ControllerState::Ended { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session_id().is_some()
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEffect {
    /// Append a `welcome` command for the newly connected client.
    SendWelcome,
    Log { kind: ActivityKind, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ControllerLink {
    Idle,
    Active { session_id: String },
    Ended { session_id: String },
}

/// Controller session state machine.
#[derive(Clone, Debug)]
pub struct ControllerMachine {
    link: ControllerLink,
    client_connected: bool,
    lock_state: LockState,
    state: ControllerState,
}

impl Default for ControllerMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMachine {
    pub fn new() -> Self {
        Self {
            link: ControllerLink::Idle,
            client_connected: false,
            lock_state: LockState::Unlocked,
            state: ControllerState::NoSession,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn client_connected(&self) -> bool {
        self.client_connected
    }

    /// Last observed `lockState`.
    pub fn lock_state(&self) -> LockState {
        self.lock_state
    }

    /// Attach to a session, seeding observations from its record.
    ///
    /// Seeding produces no effects: a client already connected when the
    /// session is loaded was welcomed by whoever saw it connect.
    pub fn open(&mut self, record: &SessionRecord) {
        self.link = ControllerLink::Active {
            session_id: record.id.clone(),
        };
        self.client_connected = record.client.connected;
        self.lock_state = record.lock_state;
        self.state = self.project();
    }

    pub fn observe_client_connected(&mut self, connected: bool) -> Vec<ControllerEffect> {
        if !matches!(self.link, ControllerLink::Active { .. }) {
            return Vec::new();
        }
        self.client_connected = connected;
        let next = self.project();
        let prev = std::mem::replace(&mut self.state, next.clone());

        match (&prev, &next) {
            (
                ControllerState::ActiveNoClient { .. },
                ControllerState::ActiveClientConnected { .. },
            ) => vec![
                ControllerEffect::Log {
                    kind: ActivityKind::Success,
                    message: "Client phone connected".into(),
                },
                ControllerEffect::SendWelcome,
            ],
            (
                ControllerState::ActiveClientConnected { .. },
                ControllerState::ActiveNoClient { .. },
            ) => vec![ControllerEffect::Log {
                kind: ActivityKind::Warning,
                message: "Client phone disconnected".into(),
            }],
            _ => Vec::new(),
        }
    }

    pub fn observe_lock_state(&mut self, value: LockState) {
        self.lock_state = value;
    }

    /// `active_*` -> `ended`.
    pub fn close(&mut self) {
        if let ControllerLink::Active { session_id } = &self.link {
            self.link = ControllerLink::Ended {
                session_id: session_id.clone(),
            };
        }
        self.client_connected = false;
        self.lock_state = LockState::Unlocked;
        self.state = self.project();
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Session id when a session is active.
    pub fn active_session(&self) -> Result<&str, SessionError> {
        self.state.session_id().ok_or(SessionError::NoActiveSession)
    }

    /// Session id when a lock may be sent: active with a client connected.
    pub fn lockable_session(&self) -> Result<&str, SessionError> {
        match &self.state {
            ControllerState::ActiveClientConnected { session_id } => Ok(session_id),
            ControllerState::ActiveNoClient { .. } => Err(SessionError::NoClientConnected),
            ControllerState::NoSession | ControllerState::Ended { .. } => {
                Err(SessionError::NoActiveSession)
            }
        }
    }

    fn project(&self) -> ControllerState {
        match &self.link {
            ControllerLink::Idle => ControllerState::NoSession,
            ControllerLink::Ended { session_id } => ControllerState::Ended {
                session_id: session_id.clone(),
            },
            ControllerLink::Active { session_id } => {
                if self.client_connected {
                    ControllerState::ActiveClientConnected {
                        session_id: session_id.clone(),
                    }
                } else {
                    ControllerState::ActiveNoClient {
                        session_id: session_id.clone(),
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
