use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Identifies one input channel on one device. The map key for all
/// per-channel state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub device_id: String,
    pub channel_index: u16,
}

impl ChannelKey {
    pub fn new(device_id: impl Into<String>, channel_index: u16) -> Self {
        Self {
            device_id: device_id.into(),
            channel_index,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.channel_index)
    }
}

/// One fixed-size slice of mono samples, normalized to [-1.0, 1.0].
/// The sample buffer is shared immutably across every consumer queue.
#[derive(Debug, Clone)]
pub struct SampleChunk {
    pub samples: Arc<[f32]>,
    pub timestamp: Instant,
    pub sample_rate: u32,
}

impl SampleChunk {
    pub fn new(samples: Vec<f32>, timestamp: Instant, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            timestamp,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_duration_follows_sample_rate() {
        let chunk = SampleChunk::new(vec![0.0; 1024], Instant::now(), 16_000);
        assert_eq!(chunk.len(), 1024);
        assert_eq!(chunk.duration(), Duration::from_secs_f64(1024.0 / 16_000.0));
    }

    #[test]
    fn clones_share_the_sample_buffer() {
        let chunk = SampleChunk::new(vec![0.5; 8], Instant::now(), 16_000);
        let copy = chunk.clone();
        assert!(Arc::ptr_eq(&chunk.samples, &copy.samples));
    }

    #[test]
    fn channel_key_display_pairs_device_and_index() {
        let key = ChannelKey::new("hw:1", 3);
        assert_eq!(key.to_string(), "hw:1:3");
    }
}
