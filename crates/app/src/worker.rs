use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use popwatch_audio::{
    chunk_rms, ChannelKey, ChunkReceiver, LevelMonitor, QueueMessage, SampleChunk, Window,
    WindowAggregator,
};
use popwatch_foundation::{PipelineError, SharedClock};
use popwatch_telemetry::{ChunkRateTracker, PipelineMetrics};

use crate::analysis::{normalize_peak, AnalysisProvider};
use crate::dump::WindowDumper;
use crate::events::{EventSink, PipelineEvent};

pub(crate) enum WorkerControl {
    EmitBuffer,
}

/// Cancel flag plus a done channel for joining with a deadline. The sender
/// half lives in the worker thread and drops when it exits, panics
/// included, so a disconnect on `done_rx` means the thread is gone.
pub(crate) struct WorkerHandle {
    cancel: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn spawn<F>(name: String, body: F) -> Result<Self, PipelineError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<()>(0);
        let thread_cancel = Arc::clone(&cancel);
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _done_guard = done_tx;
                body(thread_cancel);
            })
            .map_err(|e| PipelineError::Fatal(format!("Failed to spawn worker thread: {}", e)))?;
        Ok(Self {
            cancel,
            done_rx,
            join: Some(join),
        })
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// True when the thread exited within the timeout. On timeout the
    /// cancel flag is left set and the thread stays detached.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.cancel();
                false
            }
        }
    }
}

pub(crate) struct AnalysisWorkerConfig {
    pub key: ChannelKey,
    pub chunks: ChunkReceiver,
    pub control: Receiver<WorkerControl>,
    pub target_samples: usize,
    pub level_interval: Duration,
    pub level_smoothing: f32,
    pub poll_timeout: Duration,
    pub provider: AnalysisProvider,
    pub events: EventSink,
    pub metrics: Arc<PipelineMetrics>,
    pub clock: SharedClock,
    pub dumper: Option<WindowDumper>,
}

pub(crate) fn spawn_analysis(cfg: AnalysisWorkerConfig) -> Result<WorkerHandle, PipelineError> {
    let name = format!("analysis-{}", cfg.key);
    WorkerHandle::spawn(name, move |cancel| AnalysisWorker::new(cfg).run(cancel))
}

/// Consumes one channel's chunk queue: level tracking, window aggregation
/// and feature extraction all happen on this thread.
struct AnalysisWorker {
    key: ChannelKey,
    chunks: ChunkReceiver,
    control: Receiver<WorkerControl>,
    poll_timeout: Duration,
    aggregator: WindowAggregator,
    level: LevelMonitor,
    rate: ChunkRateTracker,
    provider: AnalysisProvider,
    events: EventSink,
    metrics: Arc<PipelineMetrics>,
    dumper: Option<WindowDumper>,
}

impl AnalysisWorker {
    fn new(cfg: AnalysisWorkerConfig) -> Self {
        Self {
            aggregator: WindowAggregator::new(cfg.target_samples),
            level: LevelMonitor::new(cfg.level_interval, cfg.level_smoothing, cfg.clock),
            rate: ChunkRateTracker::new(),
            key: cfg.key,
            chunks: cfg.chunks,
            control: cfg.control,
            poll_timeout: cfg.poll_timeout,
            provider: cfg.provider,
            events: cfg.events,
            metrics: cfg.metrics,
            dumper: cfg.dumper,
        }
    }

    fn run(mut self, cancel: Arc<AtomicBool>) {
        tracing::debug!("Analysis worker for {} started", self.key);
        loop {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            while let Ok(WorkerControl::EmitBuffer) = self.control.try_recv() {
                self.emit_pending_buffer();
            }
            match self.chunks.recv_timeout(self.poll_timeout) {
                Ok(QueueMessage::Chunk(chunk)) => self.on_chunk(chunk),
                Ok(QueueMessage::EndOfStream) => {
                    self.drain();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // Producer vanished without a sentinel. Salvage what is
                    // buffered and exit.
                    self.drain();
                    break;
                }
            }
        }
        self.aggregator.remove(&self.key);
        self.level.remove(&self.key);
        tracing::debug!("Analysis worker for {} exited", self.key);
    }

    fn on_chunk(&mut self, chunk: SampleChunk) {
        self.metrics.record_chunk();
        if let Some(rate) = self.rate.tick() {
            self.metrics.update_chunk_rate(rate);
        }

        if let Some(reading) = self.level.observe(&self.key, &chunk.samples) {
            self.metrics.update_rms(reading.rms);
            self.metrics.increment_level_events();
            self.emit(PipelineEvent::LevelUpdate {
                channel: self.key.to_string(),
                rms: reading.rms,
                peak: reading.peak,
            });
        }

        self.aggregator.on_chunk(&self.key, chunk);
        while let Some(window) = self.aggregator.try_emit(&self.key) {
            self.analyze(window);
        }
    }

    fn analyze(&mut self, mut window: Window) {
        if let Some(dumper) = &mut self.dumper {
            if let Err(e) = dumper.write(&window) {
                tracing::warn!("Failed to dump window for {}: {}", self.key, e);
            }
        }

        let raw_rms = chunk_rms(&window.samples);
        normalize_peak(&mut window.samples);

        match self.provider.extractor.extract(&window) {
            Ok(features) => {
                self.metrics.increment_windows_emitted();
                if self.provider.detector.detect(&features) {
                    self.metrics.increment_anomaly_events();
                    tracing::info!(
                        "Anomaly detected on {} (window rms {:.4})",
                        self.key,
                        raw_rms
                    );
                    self.emit(PipelineEvent::AnomalyDetected {
                        channel: self.key.to_string(),
                        timestamp: Utc::now(),
                        window_rms: raw_rms,
                    });
                }
            }
            Err(e) => {
                self.metrics.increment_windows_discarded();
                tracing::debug!("Discarded window for {}: {}", self.key, e);
            }
        }
    }

    /// End-of-stream: emit whatever full windows remain, then analyze the
    /// short tail instead of throwing it away.
    fn drain(&mut self) {
        while let Some(window) = self.aggregator.try_emit(&self.key) {
            self.analyze(window);
        }
        if let Some(window) = self.aggregator.flush(&self.key) {
            tracing::debug!(
                "Final short window for {}: {} samples",
                self.key,
                window.len()
            );
            self.analyze(window);
        }
    }

    fn emit_pending_buffer(&mut self) {
        if let Some(window) = self.aggregator.pending_snapshot(&self.key) {
            self.metrics.increment_buffer_events();
            self.emit(PipelineEvent::BufferData {
                channel: self.key.to_string(),
                sample_rate: window.sample_rate,
                samples: window.samples,
            });
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if !self.events.emit(event) {
            self.metrics.add_sink_dropped(1);
        }
    }
}

pub(crate) struct TapWorkerConfig {
    pub key: ChannelKey,
    pub chunks: ChunkReceiver,
    pub poll_timeout: Duration,
    pub events: EventSink,
    pub metrics: Arc<PipelineMetrics>,
}

/// Forwards raw chunks as playback events on a queue independent from the
/// analysis path, so a stalled listener cannot hold up analysis.
pub(crate) fn spawn_tap(cfg: TapWorkerConfig) -> Result<WorkerHandle, PipelineError> {
    let name = format!("tap-{}", cfg.key);
    WorkerHandle::spawn(name, move |cancel| run_tap(cfg, cancel))
}

fn run_tap(cfg: TapWorkerConfig, cancel: Arc<AtomicBool>) {
    tracing::debug!("Tap worker for {} started", cfg.key);
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match cfg.chunks.recv_timeout(cfg.poll_timeout) {
            Ok(QueueMessage::Chunk(chunk)) => {
                cfg.metrics.increment_buffer_events();
                let delivered = cfg.events.emit(PipelineEvent::BufferData {
                    channel: cfg.key.to_string(),
                    sample_rate: chunk.sample_rate,
                    samples: chunk.samples.to_vec(),
                });
                if !delivered {
                    cfg.metrics.add_sink_dropped(1);
                }
            }
            Ok(QueueMessage::EndOfStream) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        }
    }
    tracing::debug!("Tap worker for {} exited", cfg.key);
}
