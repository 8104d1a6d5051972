use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared counters for cross-thread pipeline monitoring. Cheap to clone;
/// all clones observe the same values.
#[derive(Clone)]
pub struct PipelineMetrics {
    // Chunk flow
    pub chunks_captured: Arc<AtomicU64>,
    pub chunks_dropped: Arc<AtomicU64>,
    pub chunk_rate: Arc<AtomicU64>, // chunks per second * 10

    // Window flow
    pub windows_emitted: Arc<AtomicU64>,
    pub windows_discarded: Arc<AtomicU64>,
    pub extraction_failures: Arc<AtomicU64>,

    // Event flow
    pub level_events: Arc<AtomicU64>,
    pub anomaly_events: Arc<AtomicU64>,
    pub buffer_events: Arc<AtomicU64>,
    pub sink_dropped: Arc<AtomicU64>,

    // Level monitoring
    pub current_rms: Arc<AtomicU64>, // RMS * 1000 for precision

    // Lifecycle anomalies
    pub shutdown_timeouts: Arc<AtomicU64>,

    pub last_chunk_time: Arc<RwLock<Option<Instant>>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            chunks_captured: Arc::new(AtomicU64::new(0)),
            chunks_dropped: Arc::new(AtomicU64::new(0)),
            chunk_rate: Arc::new(AtomicU64::new(0)),

            windows_emitted: Arc::new(AtomicU64::new(0)),
            windows_discarded: Arc::new(AtomicU64::new(0)),
            extraction_failures: Arc::new(AtomicU64::new(0)),

            level_events: Arc::new(AtomicU64::new(0)),
            anomaly_events: Arc::new(AtomicU64::new(0)),
            buffer_events: Arc::new(AtomicU64::new(0)),
            sink_dropped: Arc::new(AtomicU64::new(0)),

            current_rms: Arc::new(AtomicU64::new(0)),

            shutdown_timeouts: Arc::new(AtomicU64::new(0)),

            last_chunk_time: Arc::new(RwLock::new(None)),
        }
    }
}

impl PipelineMetrics {
    pub fn record_chunk(&self) {
        self.chunks_captured.fetch_add(1, Ordering::Relaxed);
        *self.last_chunk_time.write() = Some(Instant::now());
    }

    pub fn add_dropped_chunks(&self, count: u64) {
        if count > 0 {
            self.chunks_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn update_chunk_rate(&self, rate: f64) {
        self.chunk_rate.store((rate * 10.0) as u64, Ordering::Relaxed);
    }

    pub fn increment_windows_emitted(&self) {
        self.windows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_windows_discarded(&self) {
        self.windows_discarded.fetch_add(1, Ordering::Relaxed);
        self.extraction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_level_events(&self) {
        self.level_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_anomaly_events(&self) {
        self.anomaly_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_buffer_events(&self) {
        self.buffer_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sink_dropped(&self, count: u64) {
        if count > 0 {
            self.sink_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn update_rms(&self, rms: f32) {
        self.current_rms
            .store((rms.max(0.0) as f64 * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn increment_shutdown_timeouts(&self) {
        self.shutdown_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_captured: self.chunks_captured.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            windows_emitted: self.windows_emitted.load(Ordering::Relaxed),
            windows_discarded: self.windows_discarded.load(Ordering::Relaxed),
            level_events: self.level_events.load(Ordering::Relaxed),
            anomaly_events: self.anomaly_events.load(Ordering::Relaxed),
            buffer_events: self.buffer_events.load(Ordering::Relaxed),
            sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
            shutdown_timeouts: self.shutdown_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, for end-of-run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub chunks_captured: u64,
    pub chunks_dropped: u64,
    pub windows_emitted: u64,
    pub windows_discarded: u64,
    pub level_events: u64,
    pub anomaly_events: u64,
    pub buffer_events: u64,
    pub sink_dropped: u64,
    pub shutdown_timeouts: u64,
}

/// Weight of the newest gap in the moving average.
const GAP_ALPHA: f64 = 0.2;
/// Minimum spacing between reported estimates.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Smoothed chunk-throughput estimate.
///
/// Each arrival folds the gap since the previous one into an exponentially
/// weighted moving average, so a brief stall bends the estimate instead of
/// zeroing out a counting interval. Estimates surface at most once per
/// second.
#[derive(Debug)]
pub struct ChunkRateTracker {
    last_tick: Option<Instant>,
    smoothed_gap_secs: Option<f64>,
    last_report: Option<Instant>,
}

impl ChunkRateTracker {
    pub fn new() -> Self {
        Self {
            last_tick: None,
            smoothed_gap_secs: None,
            last_report: None,
        }
    }

    /// Records one chunk arrival. Returns the chunks-per-second estimate
    /// when a report is due, `None` otherwise.
    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Option<f64> {
        let prev = self.last_tick.replace(now)?;
        let gap = now.duration_since(prev).as_secs_f64();

        let smoothed = match self.smoothed_gap_secs {
            Some(avg) => avg + GAP_ALPHA * (gap - avg),
            None => gap,
        };
        self.smoothed_gap_secs = Some(smoothed);

        if smoothed <= 0.0 {
            return None;
        }
        let due = match self.last_report {
            Some(at) => now.duration_since(at) >= REPORT_INTERVAL,
            None => true,
        };
        if !due {
            return None;
        }
        self.last_report = Some(now);
        Some(1.0 / smoothed)
    }
}

impl Default for ChunkRateTracker {
    fn default() -> Self {
        Self::new()
    }
}
