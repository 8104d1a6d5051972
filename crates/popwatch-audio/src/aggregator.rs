use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::chunk::{ChannelKey, SampleChunk};

/// Contiguous run of samples handed to feature extraction. Samples are
/// concatenated in arrival order from whole chunks.
#[derive(Debug, Clone)]
pub struct Window {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub start_timestamp: Instant,
}

impl Window {
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

#[derive(Default)]
struct AggregationState {
    pending: VecDeque<SampleChunk>,
    accumulated: usize,
}

/// Accumulates whole chunks per channel and emits windows once the target
/// sample count is covered. Chunks are never split, so a window may exceed
/// the target by less than one chunk.
pub struct WindowAggregator {
    target_samples: usize,
    channels: HashMap<ChannelKey, AggregationState>,
}

impl WindowAggregator {
    pub fn new(target_samples: usize) -> Self {
        Self {
            target_samples,
            channels: HashMap::new(),
        }
    }

    pub fn target_samples(&self) -> usize {
        self.target_samples
    }

    pub fn on_chunk(&mut self, key: &ChannelKey, chunk: SampleChunk) {
        let state = self.channels.entry(key.clone()).or_default();
        state.accumulated += chunk.len();
        state.pending.push_back(chunk);
    }

    /// Takes the next full window if enough samples have accumulated. Call
    /// in a loop; a large backlog can hold more than one window.
    pub fn try_emit(&mut self, key: &ChannelKey) -> Option<Window> {
        let state = self.channels.get_mut(key)?;
        if state.accumulated < self.target_samples {
            return None;
        }

        let mut take = 0;
        let mut total = 0;
        for chunk in &state.pending {
            take += 1;
            total += chunk.len();
            if total >= self.target_samples {
                break;
            }
        }

        let first = state.pending.front()?;
        let sample_rate = first.sample_rate;
        let start_timestamp = first.timestamp;

        let mut samples = Vec::with_capacity(total);
        for _ in 0..take {
            if let Some(chunk) = state.pending.pop_front() {
                samples.extend_from_slice(&chunk.samples);
            }
        }
        state.accumulated -= samples.len();

        Some(Window {
            samples,
            sample_rate,
            start_timestamp,
        })
    }

    /// Drains everything pending into one final window, shorter than the
    /// target. Returns None when nothing is buffered.
    pub fn flush(&mut self, key: &ChannelKey) -> Option<Window> {
        let state = self.channels.get_mut(key)?;
        let first = state.pending.front()?;
        let sample_rate = first.sample_rate;
        let start_timestamp = first.timestamp;

        let mut samples = Vec::with_capacity(state.accumulated);
        while let Some(chunk) = state.pending.pop_front() {
            samples.extend_from_slice(&chunk.samples);
        }
        state.accumulated = 0;

        Some(Window {
            samples,
            sample_rate,
            start_timestamp,
        })
    }

    /// Copies the pending chunks into a window without consuming them.
    pub fn pending_snapshot(&self, key: &ChannelKey) -> Option<Window> {
        let state = self.channels.get(key)?;
        let first = state.pending.front()?;

        let mut samples = Vec::with_capacity(state.accumulated);
        for chunk in &state.pending {
            samples.extend_from_slice(&chunk.samples);
        }

        Some(Window {
            samples,
            sample_rate: first.sample_rate,
            start_timestamp: first.timestamp,
        })
    }

    pub fn pending_samples(&self, key: &ChannelKey) -> usize {
        self.channels.get(key).map(|s| s.accumulated).unwrap_or(0)
    }

    pub fn remove(&mut self, key: &ChannelKey) {
        self.channels.remove(key);
    }
}
