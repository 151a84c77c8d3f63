//! Device collaborator driven by the client role.
//!
//! The lock overlay, input suppression and alerts live outside this crate;
//! the client only calls into a [`DeviceHooks`] implementation.

use thiserror::Error;

use crate::model::DeviceInfo;

/// Vibration pattern played when the device locks (on/off ms).
pub const LOCK_VIBRATION: &[u32] = &[200, 100, 200, 100, 200];
/// Vibration pattern played when the device unlocks.
pub const UNLOCK_VIBRATION: &[u32] = &[100];
/// Vibration pattern played by a `test` command.
pub const TEST_VIBRATION: &[u32] = &[100, 50, 100, 50, 100];

/// A single sine tone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency_hz: u32,
    pub duration_ms: u32,
    /// Gain in `0.0..=1.0`.
    pub volume: f32,
}

pub const LOCK_TONE: Tone = Tone {
    frequency_hz: 800,
    duration_ms: 500,
    volume: 0.3,
};

pub const TEST_TONE: Tone = Tone {
    frequency_hz: 440,
    duration_ms: 300,
    volume: 0.3,
};

pub const LOCK_NOTICE_TITLE: &str = "Phone Locked";
pub const LOCK_NOTICE_BODY: &str = "Your phone has been locked remotely by the controller";
pub const TEST_NOTICE_TITLE: &str = "Test Notification";
pub const TEST_NOTICE_BODY: &str = "This is a test notification from Phone Lock Client";

/// Errors reported by device hooks. Never fatal to the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not supported: {0}")]
    Unsupported(String),
}

/// Side-effect surface of the client device.
pub trait DeviceHooks: Send {
    /// Show the full-screen lock overlay.
    fn show_overlay(&mut self, session_id: &str);

    fn hide_overlay(&mut self);

    /// Stop user input from reaching the device.
    fn suppress_input(&mut self);

    fn restore_input(&mut self);

    fn vibrate(&mut self, pattern: &[u32]) -> Result<(), DeviceError>;

    fn play_tone(&mut self, tone: Tone) -> Result<(), DeviceError>;

    fn notify(&mut self, title: &str, body: &str) -> Result<(), DeviceError>;

    /// Snapshot reported to the controller on join.
    fn device_info(&self) -> DeviceInfo;
}
