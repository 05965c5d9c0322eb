//! Media collaborator boundary and per-session device binding
//!
//! Audio capture, rendering and WebRTC negotiation belong to a
//! [`MediaProvider`]. This module keeps two things on top of it:
//!
//! - [`MediaContext`]: the provider handle, the cached device list and the
//!   default device settings for new calls. It is constructed once by the
//!   client builder and shared with every session.
//! - [`SessionMedia`]: one call's input/output binding. Changes to the device,
//!   volume or mute flag are pushed to the provider right away; the binding is
//!   released when the call ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DeviceSettings, MediaConfig};
use crate::error::{ClientError, ClientResult};
use crate::stats::RtpMeasurement;

/// Audio device direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioDirection {
    /// Microphone
    Input,
    /// Speaker or headset
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub direction: AudioDirection,
    pub is_default: bool,
}

impl AudioDeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, direction: AudioDirection) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            direction,
            is_default: false,
        }
    }
}

/// Notifications pushed by the media provider
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The set of available devices changed
    DevicesChanged,
    /// Microphone permission was granted or revoked
    PermissionChanged { granted: bool },
}

/// Media collaborator
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn enumerate_devices(&self) -> ClientResult<Vec<AudioDeviceInfo>>;

    /// Device and permission notifications
    fn device_events(&self) -> broadcast::Receiver<DeviceEvent>;

    /// Apply `settings` to the `direction` stream of call `call_id`
    async fn bind(&self, call_id: &str, direction: AudioDirection, settings: &DeviceSettings) -> ClientResult<()>;

    /// Detach and stop every stream of call `call_id`
    async fn release(&self, call_id: &str) -> ClientResult<()>;

    /// Latest RTCP-style figures for call `call_id`, if any were reported
    async fn measurement(&self, call_id: &str) -> Option<RtpMeasurement>;
}

/// Provider for signalling-only clients: no devices, nothing to bind
#[derive(Debug)]
pub struct NoopMediaProvider {
    events: broadcast::Sender<DeviceEvent>,
}

impl NoopMediaProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for NoopMediaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProvider for NoopMediaProvider {
    async fn enumerate_devices(&self) -> ClientResult<Vec<AudioDeviceInfo>> {
        Ok(Vec::new())
    }

    fn device_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    async fn bind(&self, _call_id: &str, _direction: AudioDirection, _settings: &DeviceSettings) -> ClientResult<()> {
        Ok(())
    }

    async fn release(&self, _call_id: &str) -> ClientResult<()> {
        Ok(())
    }

    async fn measurement(&self, _call_id: &str) -> Option<RtpMeasurement> {
        None
    }
}

/// Shared media state for one client
pub struct MediaContext {
    provider: Arc<dyn MediaProvider>,
    devices: RwLock<Vec<AudioDeviceInfo>>,
    permission_granted: AtomicBool,
    defaults: Mutex<MediaConfig>,
    shutdown: CancellationToken,
}

impl MediaContext {
    pub fn new(provider: Arc<dyn MediaProvider>, defaults: MediaConfig) -> Arc<Self> {
        Arc::new(Self {
            provider,
            devices: RwLock::new(Vec::new()),
            permission_granted: AtomicBool::new(false),
            defaults: Mutex::new(defaults),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn provider(&self) -> &Arc<dyn MediaProvider> {
        &self.provider
    }

    /// Re-read the device list from the provider
    pub async fn refresh_devices(&self) -> ClientResult<Vec<AudioDeviceInfo>> {
        let devices = self.provider.enumerate_devices().await?;
        debug!(count = devices.len(), "Refreshed audio devices");
        *self.devices.write() = devices.clone();
        Ok(devices)
    }

    /// Follow the provider's device events until [`MediaContext::shutdown`]
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_watching(self: &Arc<Self>) {
        let mut events = self.provider.device_events();
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(context) = weak.upgrade() else { break };

                match event {
                    Ok(DeviceEvent::DevicesChanged) => {
                        if let Err(e) = context.refresh_devices().await {
                            warn!(error = %e, "Failed to refresh audio devices");
                        }
                    }
                    Ok(DeviceEvent::PermissionChanged { granted }) => {
                        info!(granted, "Microphone permission changed");
                        context.permission_granted.store(granted, Ordering::SeqCst);
                        if granted {
                            // labels only become visible once permission is granted
                            if let Err(e) = context.refresh_devices().await {
                                warn!(error = %e, "Failed to refresh audio devices");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Device event stream lagged");
                        if let Err(e) = context.refresh_devices().await {
                            warn!(error = %e, "Failed to refresh audio devices");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Device watcher stopped");
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn devices(&self) -> Vec<AudioDeviceInfo> {
        self.devices.read().clone()
    }

    pub fn devices_for(&self, direction: AudioDirection) -> Vec<AudioDeviceInfo> {
        self.devices
            .read()
            .iter()
            .filter(|d| d.direction == direction)
            .cloned()
            .collect()
    }

    pub fn has_permission(&self) -> bool {
        self.permission_granted.load(Ordering::SeqCst)
    }

    pub fn defaults(&self) -> MediaConfig {
        self.defaults.lock().clone()
    }

    /// Change the settings new sessions start with
    pub fn set_default(&self, direction: AudioDirection, settings: DeviceSettings) -> ClientResult<()> {
        validate_volume(settings.volume)?;
        let mut defaults = self.defaults.lock();
        match direction {
            AudioDirection::Input => defaults.input = settings,
            AudioDirection::Output => defaults.output = settings,
        }
        Ok(())
    }

    /// Drop a device id that is not in the cached list so the system default is used
    ///
    /// An empty cache means enumeration never ran, and the id is kept as is.
    fn resolve(&self, direction: AudioDirection, settings: &DeviceSettings) -> DeviceSettings {
        let mut resolved = settings.clone();
        if let Some(id) = &settings.device_id {
            let devices = self.devices.read();
            let known = devices.is_empty() || devices.iter().any(|d| d.direction == direction && &d.id == id);
            if !known {
                warn!(device_id = %id, ?direction, "Audio device is gone, using system default");
                resolved.device_id = None;
            }
        }
        resolved
    }
}

impl std::fmt::Debug for MediaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaContext")
            .field("devices", &self.devices.read().len())
            .field("permission_granted", &self.has_permission())
            .finish()
    }
}

fn validate_volume(volume: f32) -> ClientResult<()> {
    if (0.0..=1.0).contains(&volume) {
        Ok(())
    } else {
        Err(ClientError::media(format!("volume {} outside 0.0..=1.0", volume)))
    }
}

#[derive(Debug)]
struct Binding {
    input: DeviceSettings,
    output: DeviceSettings,
    released: bool,
}

/// Device binding of one call
#[derive(Debug)]
pub struct SessionMedia {
    call_id: String,
    context: Arc<MediaContext>,
    binding: Mutex<Binding>,
}

impl SessionMedia {
    pub(crate) fn new(call_id: impl Into<String>, context: Arc<MediaContext>) -> Self {
        let defaults = context.defaults();
        Self {
            call_id: call_id.into(),
            context,
            binding: Mutex::new(Binding {
                input: defaults.input,
                output: defaults.output,
                released: false,
            }),
        }
    }

    pub fn context(&self) -> &Arc<MediaContext> {
        &self.context
    }

    pub fn input(&self) -> DeviceSettings {
        self.binding.lock().input.clone()
    }

    pub fn output(&self) -> DeviceSettings {
        self.binding.lock().output.clone()
    }

    pub fn is_released(&self) -> bool {
        self.binding.lock().released
    }

    /// Push both directions to the provider
    pub(crate) async fn attach(&self) -> ClientResult<()> {
        self.push(AudioDirection::Input).await?;
        self.push(AudioDirection::Output).await
    }

    /// Replace the settings of one direction before the call is attached
    pub(crate) fn preset(&self, direction: AudioDirection, settings: DeviceSettings) -> ClientResult<()> {
        validate_volume(settings.volume)?;
        let mut binding = self.binding.lock();
        match direction {
            AudioDirection::Input => binding.input = settings,
            AudioDirection::Output => binding.output = settings,
        }
        Ok(())
    }

    pub async fn set_device(&self, direction: AudioDirection, device_id: Option<String>) -> ClientResult<()> {
        self.update(direction, |s| s.device_id = device_id)?;
        self.push(direction).await
    }

    pub async fn set_volume(&self, direction: AudioDirection, volume: f32) -> ClientResult<()> {
        validate_volume(volume)?;
        self.update(direction, |s| s.volume = volume)?;
        self.push(direction).await
    }

    pub async fn set_muted(&self, direction: AudioDirection, muted: bool) -> ClientResult<()> {
        self.update(direction, |s| s.muted = muted)?;
        self.push(direction).await
    }

    fn update(&self, direction: AudioDirection, change: impl FnOnce(&mut DeviceSettings)) -> ClientResult<()> {
        let mut binding = self.binding.lock();
        if binding.released {
            return Err(ClientError::media(format!("media of call {} already released", self.call_id)));
        }
        match direction {
            AudioDirection::Input => change(&mut binding.input),
            AudioDirection::Output => change(&mut binding.output),
        }
        Ok(())
    }

    async fn push(&self, direction: AudioDirection) -> ClientResult<()> {
        let settings = {
            let binding = self.binding.lock();
            if binding.released {
                return Ok(());
            }
            match direction {
                AudioDirection::Input => binding.input.clone(),
                AudioDirection::Output => binding.output.clone(),
            }
        };
        let settings = self.context.resolve(direction, &settings);
        self.context.provider.bind(&self.call_id, direction, &settings).await
    }

    /// Release the streams; later calls are no-ops
    pub(crate) async fn release(&self) {
        {
            let mut binding = self.binding.lock();
            if binding.released {
                return;
            }
            binding.released = true;
        }
        if let Err(e) = self.context.provider.release(&self.call_id).await {
            warn!(call_id = %self.call_id, error = %e, "Failed to release session media");
        }
    }
}
