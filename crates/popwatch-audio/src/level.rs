use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use popwatch_foundation::SharedClock;

use crate::chunk::ChannelKey;

/// One rate-limited level report. `rms` is exponentially smoothed across
/// chunks, `peak` is taken from the chunk that triggered the report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    pub rms: f32,
    pub peak: f32,
}

struct LevelState {
    smoothed_rms: f32,
    last_emit: Option<Instant>,
}

/// Per-channel RMS tracker. Every chunk updates the smoothed level; a
/// reading is returned only when at least `interval` has passed since the
/// last one. The first chunk on a channel always produces a reading.
pub struct LevelMonitor {
    interval: Duration,
    smoothing: f32,
    clock: SharedClock,
    channels: HashMap<ChannelKey, LevelState>,
}

impl LevelMonitor {
    pub fn new(interval: Duration, smoothing: f32, clock: SharedClock) -> Self {
        Self {
            interval,
            smoothing,
            clock,
            channels: HashMap::new(),
        }
    }

    pub fn observe(&mut self, key: &ChannelKey, samples: &[f32]) -> Option<LevelReading> {
        let rms = chunk_rms(samples);
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let now = self.clock.now();

        let state = match self.channels.entry(key.clone()) {
            Entry::Occupied(e) => {
                let state = e.into_mut();
                state.smoothed_rms =
                    self.smoothing * state.smoothed_rms + (1.0 - self.smoothing) * rms;
                state
            }
            // The first chunk seeds the smoothed level directly.
            Entry::Vacant(e) => e.insert(LevelState {
                smoothed_rms: rms,
                last_emit: None,
            }),
        };

        let due = match state.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if !due {
            return None;
        }

        state.last_emit = Some(now);
        Some(LevelReading {
            rms: state.smoothed_rms,
            peak,
        })
    }

    pub fn remove(&mut self, key: &ChannelKey) {
        self.channels.remove(key);
    }
}

pub fn chunk_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}
