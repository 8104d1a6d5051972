use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

/// Outbound pipeline event, serialized as tagged JSON for whatever
/// front-end is attached.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    LevelUpdate {
        channel: String,
        rms: f32,
        peak: f32,
    },
    AnomalyDetected {
        channel: String,
        timestamp: DateTime<Utc>,
        window_rms: f32,
    },
    BufferData {
        channel: String,
        sample_rate: u32,
        samples: Vec<f32>,
    },
    ChannelStarted {
        channel: String,
        device: String,
        sample_rate: u32,
    },
    ChannelStopped {
        channel: String,
        clean: bool,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::LevelUpdate { .. } => "level_update",
            PipelineEvent::AnomalyDetected { .. } => "anomaly_detected",
            PipelineEvent::BufferData { .. } => "buffer_data",
            PipelineEvent::ChannelStarted { .. } => "channel_started",
            PipelineEvent::ChannelStopped { .. } => "channel_stopped",
        }
    }
}

/// Bounded, non-blocking event outlet shared by all workers. A full or
/// disconnected sink drops the event rather than stalling audio processing.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<PipelineEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Returns false when the event was dropped.
    pub fn emit(&self, event: PipelineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::warn!(
                        "Event sink full, {} events dropped so far (latest: {})",
                        dropped,
                        event.kind()
                    );
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
