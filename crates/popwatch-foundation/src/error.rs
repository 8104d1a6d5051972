use std::time::Duration;
use thiserror::Error;

use crate::state::ChannelLifecycle;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("configuration error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("channel {channel} is not active")]
    ChannelNotActive { channel: String },

    #[error("invalid lifecycle transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ChannelLifecycle,
        to: ChannelLifecycle,
    },

    #[error("fatal error, cannot recover: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("channel {requested} out of range: device '{device}' has {available} input channels")]
    InvalidChannel {
        device: String,
        requested: u16,
        available: u16,
    },

    #[error("failed to open device: {0}")]
    DeviceOpen(#[from] DeviceOpenError),

    #[error("stream did not start within {timeout:?}")]
    StartTimeout { timeout: Duration },

    #[error("fatal capture error: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum DeviceOpenError {
    #[error("device not found: {name:?}")]
    NotFound { name: Option<String> },

    #[error("device '{device}' has no input config at {rate} Hz")]
    RateNotSupported { device: String, rate: u32 },

    #[error("sample format not supported: {format}")]
    FormatNotSupported { format: String },

    #[error("device enumeration error: {0}")]
    Enumerate(#[from] cpal::DevicesError),

    #[error("supported stream configs error: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("build stream error: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("play stream error: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
}

#[derive(Debug, Clone)]
pub enum RecoveryStrategy {
    Retry { max_attempts: u32, delay: Duration },
    Fallback { to: String },
    Ignore,
    Fatal,
}

impl PipelineError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            PipelineError::Capture(CaptureError::DeviceOpen(DeviceOpenError::NotFound {
                ..
            })) => RecoveryStrategy::Fallback {
                to: "default".into(),
            },
            PipelineError::Capture(CaptureError::StartTimeout { .. }) => RecoveryStrategy::Retry {
                max_attempts: 3,
                delay: Duration::from_secs(1),
            },
            PipelineError::Capture(CaptureError::DeviceOpen(
                DeviceOpenError::BuildStream(_) | DeviceOpenError::PlayStream(_),
            )) => RecoveryStrategy::Retry {
                max_attempts: 3,
                delay: Duration::from_secs(2),
            },
            PipelineError::ChannelNotActive { .. } => RecoveryStrategy::Ignore,
            _ => RecoveryStrategy::Fatal,
        }
    }
}
