//! Harness for exercising controller and client together.
//!
//! Provides a recording device, a store wrapper that injects failures, and
//! the end-to-end lock cycle used by the integration tests and the demo
//! command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::activity::ActivityLog;
use crate::client::{Client, ClientConfig, ClientEvent};
use crate::controller::{Controller, ControllerConfig, ControllerEvent};
use crate::device::{DeviceError, DeviceHooks, Tone};
use crate::errors::SessionError;
use crate::model::DeviceInfo;
use crate::store::{SessionStore, StoreError};
use crate::types::now_millis;
use crate::watch::{Subscription, SubscriptionId};

// ============================================================================
// Recording device
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    ShowOverlay(String),
    HideOverlay,
    SuppressInput,
    RestoreInput,
    Vibrate(Vec<u32>),
    Tone(Tone),
    Notify { title: String, body: String },
}

/// Device that records every call and tracks overlay/input state.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub calls: Vec<DeviceCall>,
    pub overlay_visible: bool,
    pub input_suppressed: bool,
    /// Refuse vibration as a browser without permission would.
    pub deny_vibration: bool,
    /// Refuse notifications as a browser without permission would.
    pub deny_notifications: bool,
    pub info: DeviceInfo,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                user_agent: "rlk-harness".into(),
                platform: std::env::consts::OS.into(),
                language: "en-US".into(),
                ..DeviceInfo::default()
            },
            ..Self::default()
        }
    }

    pub fn count(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }
}

impl DeviceHooks for RecordingDevice {
    fn show_overlay(&mut self, session_id: &str) {
        self.overlay_visible = true;
        self.calls.push(DeviceCall::ShowOverlay(session_id.to_string()));
    }

    fn hide_overlay(&mut self) {
        self.overlay_visible = false;
        self.calls.push(DeviceCall::HideOverlay);
    }

    fn suppress_input(&mut self) {
        self.input_suppressed = true;
        self.calls.push(DeviceCall::SuppressInput);
    }

    fn restore_input(&mut self) {
        self.input_suppressed = false;
        self.calls.push(DeviceCall::RestoreInput);
    }

    fn vibrate(&mut self, pattern: &[u32]) -> Result<(), DeviceError> {
        if self.deny_vibration {
            return Err(DeviceError::PermissionDenied("vibration".into()));
        }
        self.calls.push(DeviceCall::Vibrate(pattern.to_vec()));
        Ok(())
    }

    fn play_tone(&mut self, tone: Tone) -> Result<(), DeviceError> {
        self.calls.push(DeviceCall::Tone(tone));
        Ok(())
    }

    fn notify(&mut self, title: &str, body: &str) -> Result<(), DeviceError> {
        if self.deny_notifications {
            return Err(DeviceError::PermissionDenied("notifications".into()));
        }
        self.calls.push(DeviceCall::Notify {
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            timestamp: now_millis(),
            ..self.info.clone()
        }
    }
}

// ============================================================================
// Failure injection
// ============================================================================

/// Store wrapper that fails writes (or reads) on demand.
pub struct FlakyStore<S: SessionStore> {
    inner: S,
    write_failure: RwLock<Option<StoreError>>,
    read_failure: RwLock<Option<StoreError>>,
}

impl<S: SessionStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            write_failure: RwLock::new(None),
            read_failure: RwLock::new(None),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail every write with `error` until cleared with `None`.
    pub async fn fail_writes(&self, error: Option<StoreError>) {
        *self.write_failure.write().await = error;
    }

    pub async fn fail_reads(&self, error: Option<StoreError>) {
        *self.read_failure.write().await = error;
    }

    async fn check_write(&self) -> Result<(), StoreError> {
        match self.write_failure.read().await.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn check_read(&self) -> Result<(), StoreError> {
        match self.read_failure.read().await.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<S: SessionStore> SessionStore for FlakyStore<S> {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.check_read().await?;
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.check_write().await?;
        self.inner.write(path, value).await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.check_write().await?;
        self.inner.update(path, fields).await
    }

    async fn write_if_present(&self, path: &str, value: Value) -> Result<bool, StoreError> {
        self.check_write().await?;
        self.inner.write_if_present(path, value).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.check_write().await?;
        self.inner.delete(path).await
    }

    async fn append(&self, path: &str, record: Value) -> Result<String, StoreError> {
        self.check_write().await?;
        self.inner.append(path, record).await
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        self.inner.subscribe(path).await
    }

    async fn subscribe_child_added(&self, path: &str) -> Result<Subscription, StoreError> {
        self.inner.subscribe_child_added(path).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StoreError> {
        self.inner.unsubscribe(id).await
    }
}

// ============================================================================
// Driving both roles
// ============================================================================

/// How long a drain waits for another event before returning.
pub const DEFAULT_IDLE: Duration = Duration::from_millis(50);

/// Process controller events until none arrives within `idle`.
///
/// Only the wait is timed; a picked-up event is always processed in full.
pub async fn drain_controller<S: SessionStore + ?Sized>(
    controller: &mut Controller<S>,
    idle: Duration,
) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    while let Ok(Some(wake)) = tokio::time::timeout(idle, controller.recv()).await {
        match controller.process(wake).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(_) => break,
        }
    }
    events
}

/// Process client events until none arrives within `idle`.
pub async fn drain_client<S: SessionStore + ?Sized, D: DeviceHooks>(
    client: &mut Client<S, D>,
    idle: Duration,
) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(Some(wake)) = tokio::time::timeout(idle, client.recv()).await {
        match client.process(wake).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(_) => break,
        }
    }
    events
}

/// Both roles' state after one step of the lock cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoStep {
    pub label: &'static str,
    pub controller_state: String,
    pub client_state: String,
    pub overlay_visible: bool,
}

#[derive(Debug, Clone)]
pub struct DemoTranscript {
    pub session_id: String,
    pub share_link: String,
    pub steps: Vec<DemoStep>,
    pub device_calls: Vec<DeviceCall>,
}

/// Run create, join, lock, unlock, end against `store` with a recording device.
pub async fn run_lock_cycle<S: SessionStore + ?Sized>(
    store: Arc<S>,
    activity: Arc<ActivityLog>,
    idle: Duration,
) -> Result<DemoTranscript, SessionError> {
    let mut controller = Controller::new(store.clone(), activity.clone(), ControllerConfig::default());
    let mut client = Client::new(store, RecordingDevice::new(), activity, ClientConfig::generate());
    let mut steps = Vec::new();

    macro_rules! step {
        ($label:expr) => {{
            drain_controller(&mut controller, idle).await;
            drain_client(&mut client, idle).await;
            drain_controller(&mut controller, idle).await;
            steps.push(DemoStep {
                label: $label,
                controller_state: controller.state().name().to_string(),
                client_state: client.state().name().to_string(),
                overlay_visible: client.device().overlay_visible,
            });
        }};
    }

    let session_id = controller.create_session().await?;
    let share_link = controller.share_link()?;
    step!("create");

    client.connect(&share_link).await?;
    step!("join");

    controller.send_lock().await?;
    step!("lock");

    controller.send_unlock().await?;
    step!("unlock");

    controller.end_session().await?;
    step!("end");

    Ok(DemoTranscript {
        session_id,
        share_link,
        steps,
        device_calls: client.device().calls.clone(),
    })
}
