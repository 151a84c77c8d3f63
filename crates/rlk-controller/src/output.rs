//! Output formatting for CLI results
//!
//! Three output formats:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting and automation
//! - Quiet: Minimal output, exit codes only

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use qrcode::render::{svg, unicode};
use qrcode::types::QrError;
use qrcode::QrCode;
use serde::Serialize;

use rlk_core::controller::{ControllerEvent, ControllerView};
use rlk_core::harness::DemoTranscript;
use rlk_core::{Command, SessionRecord};

use crate::ExitCode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper for consistent schema
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: None,
        }
    }

    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::success(data)
        }
    }
}

impl JsonResponse<()> {
    pub fn error(message: &str) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: None,
        }
    }
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    /// Session record plus the share link.
    pub fn format_session(&self, record: &SessionRecord, link: &str, view: Option<&ControllerView>) -> String {
        match self.format {
            OutputFormat::Table => self.session_table(record, link, view),
            OutputFormat::Json => self.to_json_response(&SessionOutput::new(record, link), "session"),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_command(&self, session_id: &str, command: &Command) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Property", "Value"]);
                table.add_row(vec!["Session ID", session_id]);
                table.add_row(vec!["Command", command.type_name()]);
                table.add_row(vec!["Command ID", &command.id]);
                table.add_row(vec!["Sent At", &format_millis(command.timestamp)]);
                table.to_string()
            }
            OutputFormat::Json => {
                let data = CommandOutput {
                    session_id: session_id.to_string(),
                    command: serde_json::to_value(command).unwrap_or_default(),
                };
                self.to_json_response(&data, command.type_name())
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Share link, with a terminal QR code in table mode.
    pub fn format_link(&self, session_id: &str, link: &str, show_qr: bool) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut out = format!("Share link: {link}");
                if show_qr {
                    match render_qr_terminal(link) {
                        Ok(qr) => {
                            out.push('\n');
                            out.push_str(&qr);
                        }
                        Err(e) => out.push_str(&format!("\n(QR code unavailable: {e})")),
                    }
                }
                out
            }
            OutputFormat::Json => self.to_json_response(
                &LinkOutput {
                    session_id: session_id.to_string(),
                    link: link.to_string(),
                },
                "link",
            ),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// One line per observed event, for `watch`.
    pub fn format_event(&self, event: &ControllerEvent) -> String {
        match self.format {
            OutputFormat::Table => match event {
                ControllerEvent::ClientPresence { connected } => {
                    format!("client {}", if *connected { "connected" } else { "disconnected" })
                }
                ControllerEvent::LockState(state) => format!("lockState {state}"),
                ControllerEvent::CommandLogged { key, command } => {
                    format!("command {} ({key})", command.type_name())
                }
                ControllerEvent::DeviceInfo(Some(info)) => {
                    format!("device {} / {}", info.platform, info.user_agent)
                }
                ControllerEvent::DeviceInfo(None) => "device unknown".to_string(),
                ControllerEvent::Detached => "detached from session".to_string(),
            },
            OutputFormat::Json => {
                let line = match event {
                    ControllerEvent::ClientPresence { connected } => {
                        serde_json::json!({"event": "client_presence", "connected": connected})
                    }
                    ControllerEvent::LockState(state) => {
                        serde_json::json!({"event": "lock_state", "lockState": state})
                    }
                    ControllerEvent::CommandLogged { key, command } => {
                        serde_json::json!({"event": "command", "key": key, "command": command})
                    }
                    ControllerEvent::DeviceInfo(info) => {
                        serde_json::json!({"event": "device_info", "deviceInfo": info})
                    }
                    ControllerEvent::Detached => serde_json::json!({"event": "detached"}),
                };
                line.to_string()
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_demo(&self, transcript: &DemoTranscript) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Step", "Controller", "Client", "Overlay"]);
                for step in &transcript.steps {
                    table.add_row(vec![
                        step.label,
                        &step.controller_state,
                        &step.client_state,
                        if step.overlay_visible { "shown" } else { "hidden" },
                    ]);
                }
                format!(
                    "Session: {}\nLink:    {}\n{table}\nDevice calls: {}",
                    transcript.session_id,
                    transcript.share_link,
                    transcript.device_calls.len()
                )
            }
            OutputFormat::Json => {
                let data = DemoOutput {
                    session_id: transcript.session_id.clone(),
                    share_link: transcript.share_link.clone(),
                    steps: transcript
                        .steps
                        .iter()
                        .map(|s| DemoStepJson {
                            label: s.label.to_string(),
                            controller_state: s.controller_state.clone(),
                            client_state: s.client_state.clone(),
                            overlay_visible: s.overlay_visible,
                        })
                        .collect(),
                    device_calls: transcript.device_calls.iter().map(|c| format!("{c:?}")).collect(),
                };
                self.to_json_response(&data, "demo")
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_success<T: Serialize>(&self, data: &T, command: &str) -> String {
        match self.format {
            OutputFormat::Json => self.to_json_response(data, command),
            OutputFormat::Table | OutputFormat::Quiet => String::new(),
        }
    }

    /// Format error with exit code context
    pub fn format_error_with_code(&self, error: &dyn std::fmt::Display, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {error}"),
            OutputFormat::Json => {
                let output = ErrorOutput {
                    success: false,
                    error: error.to_string(),
                    exit_code: code as i32,
                    exit_code_name: code.name(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                };
                self.to_json(&output)
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Progress message, verbose table mode only
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn warning(&self, message: &str) {
        match self.format {
            OutputFormat::Table => eprintln!("⚠ {message}"),
            OutputFormat::Json => println!(
                "{}",
                self.to_json(&serde_json::json!({
                    "warning": message,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }))
            ),
            OutputFormat::Quiet => {}
        }
    }

    /// Print a non-empty rendered block.
    pub fn print(&self, rendered: &str) {
        if !rendered.is_empty() {
            println!("{rendered}");
        }
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        self.to_json(&JsonResponse::success_with_command(value, command))
    }

    fn session_table(&self, record: &SessionRecord, link: &str, view: Option<&ControllerView>) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Session ID", &record.id]);
        table.add_row(vec!["Status", record.status.as_str()]);
        table.add_row(vec!["Lock State", record.lock_state.as_str()]);
        table.add_row(vec!["Created", &format_millis(record.created)]);
        table.add_row(vec!["Client", if record.client.connected { "connected" } else { "not connected" }]);
        table.add_row(vec![
            "Client Last Seen",
            &record.client.last_seen.map(format_millis).unwrap_or_else(|| "Never".to_string()),
        ]);
        let device = view
            .and_then(|v| v.client_device.as_ref())
            .or(record.client.device_info.as_ref());
        if let Some(device) = device {
            table.add_row(vec!["Client Device", &format!("{} / {}", device.platform, device.user_agent)]);
        }
        table.add_row(vec!["Commands", &record.commands.len().to_string()]);
        if let Some(last) = record.last_command() {
            table.add_row(vec!["Last Command", &format!("{} at {}", last.type_name(), format_millis(last.timestamp))]);
        }
        table.add_row(vec!["Share Link", link]);
        table.to_string()
    }
}

/// QR code drawn with half-block characters, light modules on a dark terminal.
pub fn render_qr_terminal(data: &str) -> Result<String, QrError> {
    let code = QrCode::new(data.as_bytes())?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

pub fn render_qr_svg(data: &str) -> Result<String, QrError> {
    let code = QrCode::new(data.as_bytes())?;
    Ok(code
        .render()
        .min_dimensions(200, 200)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#FFFFFF"))
        .build())
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// JSON output structures

#[derive(Serialize)]
struct SessionOutput {
    session_id: String,
    status: String,
    lock_state: String,
    created: i64,
    client_connected: bool,
    client_last_seen: Option<i64>,
    command_count: usize,
    share_link: String,
}

impl SessionOutput {
    fn new(record: &SessionRecord, link: &str) -> Self {
        Self {
            session_id: record.id.clone(),
            status: record.status.as_str().to_string(),
            lock_state: record.lock_state.as_str().to_string(),
            created: record.created,
            client_connected: record.client.connected,
            client_last_seen: record.client.last_seen,
            command_count: record.commands.len(),
            share_link: link.to_string(),
        }
    }
}

#[derive(Serialize)]
struct CommandOutput {
    session_id: String,
    command: serde_json::Value,
}

#[derive(Serialize)]
struct LinkOutput {
    session_id: String,
    link: String,
}

#[derive(Serialize)]
struct DemoOutput {
    session_id: String,
    share_link: String,
    steps: Vec<DemoStepJson>,
    device_calls: Vec<String>,
}

#[derive(Serialize)]
struct DemoStepJson {
    label: String,
    controller_state: String,
    client_state: String,
    overlay_visible: bool,
}

#[derive(Serialize)]
struct ErrorOutput {
    success: bool,
    error: String,
    exit_code: i32,
    exit_code_name: &'static str,
    timestamp: String,
}

/// Simple success message for JSON output
#[derive(Serialize)]
pub struct SuccessMessage {
    pub message: String,
}

impl SuccessMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlk_core::model::SessionSettings;
    use rlk_core::CommandPayload;

    fn record() -> SessionRecord {
        SessionRecord::new("session_1_abc", "ctl", 1_700_000_000_000, SessionSettings::default())
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!(OutputFormat::from_str("table").unwrap(), OutputFormat::Table);
        assert_eq!(OutputFormat::from_str("JSON").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("quiet").unwrap(), OutputFormat::Quiet);
        assert!(OutputFormat::from_str("invalid").is_err());
        assert_eq!(OutputFormat::Json.to_string(), "json");
    }

    #[test]
    fn test_formatter_quiet_mode() {
        let formatter = OutputFormatter::new(OutputFormat::Quiet, false);
        assert!(formatter.is_quiet());
        assert_eq!(formatter.format_session(&record(), "http://x/client?session=a", None), "");
        assert_eq!(formatter.format_link("a", "http://x/client?session=a", true), "");
    }

    #[test]
    fn test_session_json_is_valid() {
        let formatter = OutputFormatter::new(OutputFormat::Json, false);
        let out = formatter.format_session(&record(), "http://x/client?session=session_1_abc", None);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["lock_state"], "unlocked");
        assert_eq!(value["data"]["client_connected"], false);
    }

    #[test]
    fn test_command_table_mentions_type() {
        let formatter = OutputFormatter::new(OutputFormat::Table, false);
        let command = Command::new(CommandPayload::Lock, 1_700_000_000_000);
        let out = formatter.format_command("session_1_abc", &command);
        assert!(out.contains("lock_1700000000000"));
        assert!(out.contains("2023-11-14"));
    }

    #[test]
    fn test_event_json_lines() {
        let formatter = OutputFormatter::new(OutputFormat::Json, false);
        let line = formatter.format_event(&ControllerEvent::ClientPresence { connected: true });
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "client_presence");
        assert_eq!(value["connected"], true);
    }

    #[test]
    fn test_error_with_code_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json, false);
        let out = formatter.format_error_with_code(&"no client connected", ExitCode::PermissionDenied);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["exit_code"], 7);
        assert_eq!(value["exit_code_name"], "PERMISSION_DENIED");
    }

    #[test]
    fn test_qr_renders() {
        let link = "http://localhost:8080/client?session=session_1_abc";
        assert!(!render_qr_terminal(link).unwrap().is_empty());
        assert!(render_qr_svg(link).unwrap().contains("<svg"));
    }
}
