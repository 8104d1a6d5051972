use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Pipeline-wide tuning knobs. Loaded from an optional TOML file with
/// `POPWATCH_*` environment overrides, then adjusted by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Analysis sample rate the stream is opened at.
    pub sample_rate_hz: u32,
    /// Samples per chunk handed to the consumer queues.
    pub chunk_size: usize,
    /// Analysis window duration. `target_samples()` derives the sample count.
    pub window_seconds: f32,
    /// Capacity of each per-consumer chunk queue.
    pub queue_capacity: usize,
    /// Minimum spacing between level-update events per channel.
    pub level_interval_ms: u64,
    /// Exponential smoothing factor for the running RMS, in [0, 1).
    pub level_smoothing: f32,
    /// Worker queue wait quantum; the cancel flag is re-checked on each wake.
    pub poll_timeout_ms: u64,
    /// Grace period for a channel's workers to drain after the sentinel.
    pub drain_timeout_ms: u64,
    /// How long to wait for the hardware stream to come up.
    pub start_timeout_ms: u64,
    /// When set, each emitted window is written to this directory as WAV.
    pub dump_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16_000,
            chunk_size: 1024,
            window_seconds: 2.0,
            queue_capacity: 200,
            level_interval_ms: 100,
            level_smoothing: 0.3,
            poll_timeout_ms: 25,
            drain_timeout_ms: 2_000,
            start_timeout_ms: 5_000,
            dump_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("POPWATCH"))
            .build()?;
        let cfg: PipelineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sample_rate_hz == 0 {
            return Err(PipelineError::Config("sample_rate_hz must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(PipelineError::Config("chunk_size must be > 0".into()));
        }
        if !(self.window_seconds > 0.0) {
            return Err(PipelineError::Config("window_seconds must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::Config("queue_capacity must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.level_smoothing) {
            return Err(PipelineError::Config(
                "level_smoothing must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Samples per analysis window at the configured rate.
    pub fn target_samples(&self) -> usize {
        (self.window_seconds as f64 * self.sample_rate_hz as f64).round() as usize
    }

    pub fn level_interval(&self) -> Duration {
        Duration::from_millis(self.level_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}
