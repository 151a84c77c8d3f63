//! Terminal rendition of the client device.
//!
//! The lock overlay is a banner, vibration and tones ring the bell, and
//! suppressed input is enforced by the interactive loop reading stdin.

use std::io::Write;

use rlk_core::device::{DeviceError, DeviceHooks, Tone};
use rlk_core::model::DeviceInfo;
use rlk_core::types::now_millis;

const BELL: &str = "\x07";

pub struct TerminalDevice<W: Write + Send = std::io::Stdout> {
    out: W,
    bell: bool,
    notifications: bool,
    overlay_visible: bool,
    input_suppressed: bool,
}

impl TerminalDevice {
    pub fn stdout(bell: bool, notifications: bool) -> Self {
        Self::new(std::io::stdout(), bell, notifications)
    }
}

impl<W: Write + Send> TerminalDevice<W> {
    pub fn new(out: W, bell: bool, notifications: bool) -> Self {
        Self {
            out,
            bell,
            notifications,
            overlay_visible: false,
            input_suppressed: false,
        }
    }

    pub fn overlay_visible(&self) -> bool {
        self.overlay_visible
    }

    /// Whether typed input other than the escape commands is dropped.
    pub fn input_suppressed(&self) -> bool {
        self.input_suppressed
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, text: &str) {
        // A closed terminal is not worth failing the session over.
        let _ = writeln!(self.out, "{text}");
        let _ = self.out.flush();
    }

    /// A bell switched off in config is silence, not a failure.
    fn ring(&mut self, times: usize) -> Result<(), DeviceError> {
        if !self.bell {
            return Ok(());
        }
        let _ = write!(self.out, "{}", BELL.repeat(times.max(1)));
        let _ = self.out.flush();
        Ok(())
    }
}

impl<W: Write + Send> DeviceHooks for TerminalDevice<W> {
    fn show_overlay(&mut self, session_id: &str) {
        self.overlay_visible = true;
        let rule = "=".repeat(48);
        self.emit(&format!(
            "\n{rule}\n  🔒 PHONE LOCKED\n  Locked remotely by the controller\n  Session: {session_id}\n{rule}"
        ));
    }

    fn hide_overlay(&mut self) {
        if self.overlay_visible {
            self.overlay_visible = false;
            self.emit("🔓 Phone unlocked");
        }
    }

    fn suppress_input(&mut self) {
        self.input_suppressed = true;
    }

    fn restore_input(&mut self) {
        self.input_suppressed = false;
    }

    fn vibrate(&mut self, pattern: &[u32]) -> Result<(), DeviceError> {
        // Even entries are pulses, odd entries pauses.
        self.ring(pattern.iter().step_by(2).count())
    }

    fn play_tone(&mut self, _tone: Tone) -> Result<(), DeviceError> {
        self.ring(1)
    }

    fn notify(&mut self, title: &str, body: &str) -> Result<(), DeviceError> {
        if !self.notifications {
            return Err(DeviceError::PermissionDenied("notifications disabled".into()));
        }
        self.emit(&format!("[{title}] {body}"));
        Ok(())
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            user_agent: format!("rlk-client/{}", env!("CARGO_PKG_VERSION")),
            platform: std::env::consts::OS.to_string(),
            language: std::env::var("LANG")
                .ok()
                .and_then(|lang| lang.split('.').next().map(|l| l.replace('_', "-")))
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| "en-US".to_string()),
            screen: None,
            battery: None,
            installed: true,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlk_core::device::{LOCK_TONE, LOCK_VIBRATION, UNLOCK_VIBRATION};

    fn device(bell: bool, notifications: bool) -> TerminalDevice<Vec<u8>> {
        TerminalDevice::new(Vec::new(), bell, notifications)
    }

    #[test]
    fn test_overlay_banner() {
        let mut dev = device(true, true);
        dev.show_overlay("session_1_abc");
        dev.suppress_input();
        assert!(dev.overlay_visible());
        assert!(dev.input_suppressed());

        dev.hide_overlay();
        dev.restore_input();
        assert!(!dev.overlay_visible());
        assert!(!dev.input_suppressed());

        let out = String::from_utf8(dev.into_inner()).unwrap();
        assert!(out.contains("PHONE LOCKED"));
        assert!(out.contains("session_1_abc"));
        assert!(out.contains("unlocked"));
    }

    #[test]
    fn test_vibration_rings_per_pulse() {
        let mut dev = device(true, true);
        dev.vibrate(LOCK_VIBRATION).unwrap();
        dev.vibrate(UNLOCK_VIBRATION).unwrap();
        let out = String::from_utf8(dev.into_inner()).unwrap();
        assert_eq!(out.matches(BELL).count(), 4);
    }

    #[test]
    fn test_disabled_bell_is_silent_not_an_error() {
        let mut dev = device(false, false);
        dev.vibrate(LOCK_VIBRATION).unwrap();
        dev.play_tone(LOCK_TONE).unwrap();
        assert!(matches!(dev.notify("t", "b"), Err(DeviceError::PermissionDenied(_))));
        assert_eq!(dev.into_inner().len(), 0);
    }

    #[test]
    fn test_device_info() {
        let info = device(true, true).device_info();
        assert!(info.user_agent.starts_with("rlk-client/"));
        assert!(info.installed);
        assert!(info.timestamp > 0);
    }
}
