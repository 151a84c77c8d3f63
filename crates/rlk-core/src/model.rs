//! Session record and command wire model.
//!
//! Field names follow the stored JSON verbatim (`lockState`, `lastSeen`,
//! `client_connected`, ...), so records written by any participant round-trip.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Paths
// ============================================================================

/// Store paths inside a session record.
pub mod paths {
    /// Root under which every session record lives.
    pub const SESSIONS: &str = "sessions";

    pub fn session(id: &str) -> String {
        format!("{SESSIONS}/{id}")
    }

    pub fn lock_state(id: &str) -> String {
        format!("{SESSIONS}/{id}/lockState")
    }

    pub fn status(id: &str) -> String {
        format!("{SESSIONS}/{id}/status")
    }

    pub fn commands(id: &str) -> String {
        format!("{SESSIONS}/{id}/commands")
    }

    pub fn settings(id: &str) -> String {
        format!("{SESSIONS}/{id}/settings")
    }

    pub fn controller(id: &str) -> String {
        format!("{SESSIONS}/{id}/controller")
    }

    pub fn client(id: &str) -> String {
        format!("{SESSIONS}/{id}/client")
    }

    pub fn client_connected(id: &str) -> String {
        format!("{SESSIONS}/{id}/client/connected")
    }

    pub fn client_last_seen(id: &str) -> String {
        format!("{SESSIONS}/{id}/client/lastSeen")
    }

    pub fn client_device_info(id: &str) -> String {
        format!("{SESSIONS}/{id}/client/deviceInfo")
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Lock state of the client device. Written by the controller only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Locked,
    #[default]
    Unlocked,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Locked => "locked",
            LockState::Unlocked => "unlocked",
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant of a `test` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Vibration,
    Sound,
    Notification,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Vibration => "vibration",
            TestKind::Sound => "sound",
            TestKind::Notification => "notification",
        }
    }
}

impl FromStr for TestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vibration" => Ok(TestKind::Vibration),
            "sound" => Ok(TestKind::Sound),
            "notification" => Ok(TestKind::Notification),
            other => Err(format!("unknown test kind: {other}")),
        }
    }
}

// ============================================================================
// Presence & Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPresence {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPresence {
    #[serde(default)]
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<i64>,
}

/// Per-session behaviour flags, read by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(default)]
    pub require_confirmation: bool,
    #[serde(default = "default_true")]
    pub vibrate_on_lock: bool,
    #[serde(default = "default_true")]
    pub sound_on_lock: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            require_confirmation: false,
            vibrate_on_lock: true,
            sound_on_lock: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenInfo {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub color_depth: u32,
}

/// Snapshot of the client device, written on join and inside `client_connected`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenInfo>,
    /// Battery level in `0.0..=1.0` when the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub timestamp: i64,
}

// ============================================================================
// Commands
// ============================================================================

/// Typed payload of a command record.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Lock,
    Unlock,
    Welcome {
        message: Option<String>,
    },
    Disconnect {
        reason: Option<String>,
    },
    Test {
        kind: Option<TestKind>,
    },
    ClientConnected {
        client_id: Option<String>,
        device: Option<DeviceInfo>,
    },
    /// Any `type` this build does not understand.
    Unknown {
        kind: String,
        data: Option<Value>,
    },
}

impl CommandPayload {
    /// Wire `type` string.
    pub fn type_name(&self) -> &str {
        match self {
            CommandPayload::Lock => "lock",
            CommandPayload::Unlock => "unlock",
            CommandPayload::Welcome { .. } => "welcome",
            CommandPayload::Disconnect { .. } => "disconnect",
            CommandPayload::Test { .. } => "test",
            CommandPayload::ClientConnected { .. } => "client_connected",
            CommandPayload::Unknown { kind, .. } => kind,
        }
    }

    /// Build a payload from a wire type and optional `data` object.
    pub fn from_parts(kind: &str, data: Option<Value>) -> Self {
        let field = |name: &str| {
            data.as_ref()
                .and_then(|d| d.get(name))
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        match kind {
            "lock" => CommandPayload::Lock,
            "unlock" => CommandPayload::Unlock,
            "welcome" => CommandPayload::Welcome {
                message: field("message"),
            },
            "disconnect" => CommandPayload::Disconnect {
                reason: field("reason"),
            },
            "test" => CommandPayload::Test {
                kind: field("type").and_then(|t| t.parse().ok()),
            },
            "client_connected" => CommandPayload::ClientConnected {
                client_id: None,
                device: None,
            },
            other => CommandPayload::Unknown {
                kind: other.to_string(),
                data,
            },
        }
    }

    fn data(&self) -> Option<Value> {
        match self {
            CommandPayload::Welcome { message } => message.as_ref().map(|m| json!({ "message": m })),
            CommandPayload::Disconnect { reason } => reason.as_ref().map(|r| json!({ "reason": r })),
            CommandPayload::Test { kind } => kind.map(|k| json!({ "type": k.as_str() })),
            CommandPayload::Unknown { data, .. } => data.clone(),
            _ => None,
        }
    }
}

/// One entry of the append-only command log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireCommand", into = "WireCommand")]
pub struct Command {
    /// `<type>_<timestamp>`; informational, not unique.
    pub id: String,
    pub timestamp: i64,
    /// Always written `false`.
    pub confirmed: bool,
    pub payload: CommandPayload,
}

impl Command {
    pub fn new(payload: CommandPayload, timestamp: i64) -> Self {
        Self {
            id: format!("{}_{}", payload.type_name(), timestamp),
            timestamp,
            confirmed: false,
            payload,
        }
    }

    pub fn type_name(&self) -> &str {
        self.payload.type_name()
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCommand {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confirmed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device: Option<DeviceInfo>,
}

impl From<WireCommand> for Command {
    fn from(wire: WireCommand) -> Self {
        let payload = match wire.kind.as_str() {
            "client_connected" => CommandPayload::ClientConnected {
                client_id: wire.client_id,
                device: wire.device,
            },
            kind => CommandPayload::from_parts(kind, wire.data),
        };
        Command {
            id: wire
                .id
                .unwrap_or_else(|| format!("{}_{}", wire.kind, wire.timestamp)),
            timestamp: wire.timestamp,
            confirmed: wire.confirmed.unwrap_or(false),
            payload,
        }
    }
}

impl From<Command> for WireCommand {
    fn from(command: Command) -> Self {
        let data = command.payload.data();
        let kind = command.payload.type_name().to_string();
        let (client_id, device) = match command.payload {
            CommandPayload::ClientConnected { client_id, device } => (client_id, device),
            _ => (None, None),
        };
        WireCommand {
            kind,
            timestamp: command.timestamp,
            id: Some(command.id),
            data,
            confirmed: Some(command.confirmed),
            client_id,
            device,
        }
    }
}

// ============================================================================
// Session Record
// ============================================================================

/// The document stored at `sessions/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub lock_state: LockState,
    #[serde(default)]
    pub controller: ControllerPresence,
    #[serde(default)]
    pub client: ClientPresence,
    #[serde(default)]
    pub commands: BTreeMap<String, Command>,
    #[serde(default)]
    pub settings: SessionSettings,
}

impl SessionRecord {
    /// Initial record written when a controller generates a session.
    pub fn new(id: &str, controller_uid: &str, now: i64, settings: SessionSettings) -> Self {
        Self {
            id: id.to_string(),
            created: now,
            status: SessionStatus::Active,
            lock_state: LockState::Unlocked,
            controller: ControllerPresence {
                uid: controller_uid.to_string(),
                connected: true,
                last_seen: Some(now),
            },
            client: ClientPresence::default(),
            commands: BTreeMap::new(),
            settings,
        }
    }

    /// Parse a record read from the store.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Most recent command in the log, by key order.
    pub fn last_command(&self) -> Option<&Command> {
        self.commands.values().next_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_record_wire_shape() {
        let record = SessionRecord::new("session_1_abc", "controller_1", 1000, SessionSettings::default());
        let value = record.to_value().unwrap();
        assert_eq!(value["lockState"], "unlocked");
        assert_eq!(value["status"], "active");
        assert_eq!(value["controller"]["connected"], true);
        assert_eq!(value["controller"]["lastSeen"], 1000);
        assert_eq!(value["client"]["connected"], false);
        assert_eq!(value["settings"]["vibrateOnLock"], true);
        assert_eq!(value["settings"]["requireConfirmation"], false);
    }

    #[test]
    fn test_record_tolerates_missing_optional_fields() {
        let record = SessionRecord::from_value(json!({"id": "s1"})).unwrap();
        assert_eq!(record.lock_state, LockState::Unlocked);
        assert_eq!(record.status, SessionStatus::Active);
        assert!(record.commands.is_empty());
        assert!(record.settings.sound_on_lock);
    }

    #[test]
    fn test_command_wire_names() {
        let cmd = Command::new(
            CommandPayload::Disconnect {
                reason: Some("session_ended".into()),
            },
            42,
        );
        let value = cmd.to_value().unwrap();
        assert_eq!(value["type"], "disconnect");
        assert_eq!(value["id"], "disconnect_42");
        assert_eq!(value["confirmed"], false);
        assert_eq!(value["data"]["reason"], "session_ended");
    }

    #[test]
    fn test_client_connected_carries_device() {
        let cmd = Command::new(
            CommandPayload::ClientConnected {
                client_id: Some("client_1".into()),
                device: Some(DeviceInfo {
                    platform: "linux".into(),
                    ..Default::default()
                }),
            },
            7,
        );
        let value = cmd.to_value().unwrap();
        assert_eq!(value["clientId"], "client_1");
        assert_eq!(value["device"]["platform"], "linux");

        let back: Command = serde_json::from_value(value).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_unknown_command_type_is_preserved() {
        let cmd: Command =
            serde_json::from_value(json!({"type": "ring", "timestamp": 3, "data": {"volume": 2}}))
                .unwrap();
        assert_eq!(cmd.type_name(), "ring");
        assert_eq!(cmd.id, "ring_3");
        assert!(matches!(cmd.payload, CommandPayload::Unknown { ref data, .. } if data.is_some()));
    }

    #[test]
    fn test_test_command_parses_kind() {
        let cmd: Command = serde_json::from_value(
            json!({"type": "test", "timestamp": 1, "data": {"type": "sound"}}),
        )
        .unwrap();
        assert_eq!(
            cmd.payload,
            CommandPayload::Test {
                kind: Some(TestKind::Sound)
            }
        );
    }

    #[test]
    fn test_last_command_follows_key_order() {
        let mut record = SessionRecord::new("s", "c", 0, SessionSettings::default());
        record
            .commands
            .insert("-c000000000002".into(), Command::new(CommandPayload::Unlock, 2));
        record
            .commands
            .insert("-c000000000001".into(), Command::new(CommandPayload::Lock, 1));
        assert_eq!(record.last_command().unwrap().type_name(), "unlock");
    }
}
