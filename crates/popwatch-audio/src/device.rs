use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};

use popwatch_foundation::{CaptureError, DeviceOpenError};

use crate::capture::{self, CaptureHandle};
use crate::chunk::ChannelKey;
use crate::fanout::ChunkFanout;

/// Input device record used to validate a channel index before any stream
/// resources are allocated.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub max_input_channels: u16,
    pub default_sample_rate: u32,
    pub is_default: bool,
}

/// Everything the capture side needs to open one channel's stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub key: ChannelKey,
    pub sample_rate_hz: u32,
    pub chunk_size: usize,
    pub start_timeout: Duration,
}

/// Seam between the supervisor and the audio subsystem. The cpal
/// implementation below talks to real hardware; tests substitute their own.
pub trait CaptureBackend: Send + Sync {
    fn devices(&self) -> Vec<DeviceInfo>;

    fn open(
        &self,
        request: StreamRequest,
        fanout: Arc<ChunkFanout>,
    ) -> Result<CaptureHandle, CaptureError>;
}

/// Checks the requested channel against the device's reported channel count.
pub fn validate_channel(
    devices: &[DeviceInfo],
    key: &ChannelKey,
) -> Result<DeviceInfo, CaptureError> {
    let device = devices
        .iter()
        .find(|d| d.id == key.device_id)
        .ok_or_else(|| {
            CaptureError::DeviceOpen(DeviceOpenError::NotFound {
                name: Some(key.device_id.clone()),
            })
        })?;

    if key.channel_index >= device.max_input_channels {
        return Err(CaptureError::InvalidChannel {
            device: device.id.clone(),
            requested: key.channel_index,
            available: device.max_input_channels,
        });
    }

    Ok(device.clone())
}

/// Capture backend over the host's default cpal audio host.
#[derive(Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for CpalBackend {
    fn devices(&self) -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let inputs = match host.input_devices() {
            Ok(inputs) => inputs,
            Err(e) => {
                tracing::warn!("Failed to enumerate input devices: {}", e);
                return Vec::new();
            }
        };

        let mut devices = Vec::new();
        for device in inputs {
            let Ok(name) = device.name() else { continue };
            let channels = max_input_channels(&device);
            if channels == 0 {
                continue;
            }
            let default_sample_rate = device
                .default_input_config()
                .map(|c| c.sample_rate().0)
                .unwrap_or(0);
            devices.push(DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                id: name.clone(),
                name,
                max_input_channels: channels,
                default_sample_rate,
            });
        }
        devices
    }

    fn open(
        &self,
        request: StreamRequest,
        fanout: Arc<ChunkFanout>,
    ) -> Result<CaptureHandle, CaptureError> {
        capture::spawn_stream(request, fanout)
    }
}

/// Widest channel layout the device advertises for input.
pub(crate) fn max_input_channels(device: &cpal::Device) -> u16 {
    let mut max = 0;
    if let Ok(configs) = device.supported_input_configs() {
        for config in configs {
            max = max.max(config.channels());
        }
    }
    if max == 0 {
        if let Ok(default) = device.default_input_config() {
            max = default.channels();
        }
    }
    max
}
