use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;

use popwatch_audio::{
    validate_channel, CaptureBackend, CaptureHandle, ChannelKey, ChunkFanout, SampleQueue,
    StreamRequest,
};
use popwatch_foundation::{
    real_clock, ChannelLifecycle, LifecycleCell, PipelineConfig, PipelineError, SharedClock,
};
use popwatch_telemetry::PipelineMetrics;

use crate::analysis::AnalysisProvider;
use crate::dump::WindowDumper;
use crate::events::{EventSink, PipelineEvent};
use crate::worker::{
    spawn_analysis, spawn_tap, AnalysisWorkerConfig, TapWorkerConfig, WorkerControl, WorkerHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The channel already has a runtime; the existing one is kept.
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Clean,
    /// Workers missed the drain deadline. Their cancel flags are set and the
    /// threads are left to exit on their own.
    TimedOut,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<ChannelKey>,
    pub timed_out: Vec<ChannelKey>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum SupervisorCommand {
    StartChannel { key: ChannelKey },
    StopChannel { key: ChannelKey },
    GetBuffer { key: ChannelKey },
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Started(StartOutcome),
    Stopped(StopOutcome),
    BufferRequested,
    ShutdownComplete(ShutdownReport),
}

/// Everything owned on behalf of one running channel. Field order matters on
/// drop: the capture handle joins the stream thread before the fanout and
/// worker handles go away.
struct ChannelRuntime {
    lifecycle: LifecycleCell,
    capture: CaptureHandle,
    fanout: Arc<ChunkFanout>,
    control_tx: Sender<WorkerControl>,
    analysis: WorkerHandle,
    tap: WorkerHandle,
}

/// Owns the per-channel runtimes and drives their lifecycle. Start wires up
/// capture, fan-out and workers as a unit; stop tears them down in reverse,
/// with the end-of-stream sentinel separating the two phases.
pub struct PipelineSupervisor {
    config: PipelineConfig,
    backend: Arc<dyn CaptureBackend>,
    provider: AnalysisProvider,
    events: EventSink,
    metrics: Arc<PipelineMetrics>,
    clock: SharedClock,
    channels: HashMap<ChannelKey, ChannelRuntime>,
}

impl PipelineSupervisor {
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn CaptureBackend>,
        provider: AnalysisProvider,
        events: EventSink,
    ) -> Self {
        Self {
            config,
            backend,
            provider,
            events,
            metrics: Arc::new(PipelineMetrics::default()),
            clock: real_clock(),
            channels: HashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn active_channels(&self) -> Vec<ChannelKey> {
        self.channels.keys().cloned().collect()
    }

    pub fn is_active(&self, key: &ChannelKey) -> bool {
        self.channels.contains_key(key)
    }

    pub fn lifecycle(&self, key: &ChannelKey) -> Option<ChannelLifecycle> {
        self.channels.get(key).map(|r| r.lifecycle.current())
    }

    pub fn handle(&mut self, command: SupervisorCommand) -> Result<CommandOutcome, PipelineError> {
        match command {
            SupervisorCommand::StartChannel { key } => {
                Ok(CommandOutcome::Started(self.start_channel(&key)?))
            }
            SupervisorCommand::StopChannel { key } => {
                Ok(CommandOutcome::Stopped(self.stop_channel(&key)?))
            }
            SupervisorCommand::GetBuffer { key } => {
                self.get_buffer(&key)?;
                Ok(CommandOutcome::BufferRequested)
            }
            SupervisorCommand::Shutdown => {
                Ok(CommandOutcome::ShutdownComplete(self.shutdown()))
            }
        }
    }

    /// Validates the channel, opens the stream and spawns both workers. Any
    /// failure after `Starting` rolls the lifecycle back to `Stopped` and
    /// releases whatever was already allocated.
    pub fn start_channel(&mut self, key: &ChannelKey) -> Result<StartOutcome, PipelineError> {
        if self.channels.contains_key(key) {
            tracing::debug!("Channel {} already active, ignoring start", key);
            return Ok(StartOutcome::AlreadyActive);
        }

        // Channel index check runs before any stream resources exist.
        let device = validate_channel(&self.backend.devices(), key)?;

        let lifecycle = LifecycleCell::new();
        lifecycle.transition(ChannelLifecycle::Starting)?;

        let fanout = Arc::new(ChunkFanout::new());
        let (analysis_tx, analysis_rx) =
            SampleQueue::bounded(&format!("{}:analysis", key), self.config.queue_capacity);
        let (tap_tx, tap_rx) =
            SampleQueue::bounded(&format!("{}:tap", key), self.config.queue_capacity);
        fanout.register(analysis_tx);
        fanout.register(tap_tx);

        let request = StreamRequest {
            key: key.clone(),
            sample_rate_hz: self.config.sample_rate_hz,
            chunk_size: self.config.chunk_size,
            start_timeout: self.config.start_timeout(),
        };

        let capture = match self.backend.open(request, Arc::clone(&fanout)) {
            Ok(capture) => capture,
            Err(e) => {
                tracing::warn!("Failed to open capture for {}: {}", key, e);
                lifecycle.transition(ChannelLifecycle::Stopped)?;
                return Err(e.into());
            }
        };

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let dumper = self.make_dumper(key);

        let analysis = match spawn_analysis(AnalysisWorkerConfig {
            key: key.clone(),
            chunks: analysis_rx,
            control: control_rx,
            target_samples: self.config.target_samples(),
            level_interval: self.config.level_interval(),
            level_smoothing: self.config.level_smoothing,
            poll_timeout: self.config.poll_timeout(),
            provider: self.provider.clone(),
            events: self.events.clone(),
            metrics: Arc::clone(&self.metrics),
            clock: Arc::clone(&self.clock),
            dumper,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                drop(capture);
                lifecycle.transition(ChannelLifecycle::Stopped)?;
                return Err(e);
            }
        };

        let tap = match spawn_tap(TapWorkerConfig {
            key: key.clone(),
            chunks: tap_rx,
            poll_timeout: self.config.poll_timeout(),
            events: self.events.clone(),
            metrics: Arc::clone(&self.metrics),
        }) {
            Ok(handle) => handle,
            Err(e) => {
                drop(capture);
                let mut analysis = analysis;
                analysis.cancel();
                analysis.join_timeout(self.config.drain_timeout());
                lifecycle.transition(ChannelLifecycle::Stopped)?;
                return Err(e);
            }
        };

        lifecycle.transition(ChannelLifecycle::Running)?;
        tracing::info!("Channel {} running on '{}'", key, device.id);
        self.emit(PipelineEvent::ChannelStarted {
            channel: key.to_string(),
            device: device.id,
            sample_rate: self.config.sample_rate_hz,
        });

        self.channels.insert(
            key.clone(),
            ChannelRuntime {
                lifecycle,
                capture,
                fanout,
                control_tx,
                analysis,
                tap,
            },
        );
        Ok(StartOutcome::Started)
    }

    /// Stops the stream, delivers the end-of-stream sentinel and waits up to
    /// the drain timeout for both workers. A missed deadline is reported, not
    /// blocked on.
    pub fn stop_channel(&mut self, key: &ChannelKey) -> Result<StopOutcome, PipelineError> {
        let mut runtime =
            self.channels
                .remove(key)
                .ok_or_else(|| PipelineError::ChannelNotActive {
                    channel: key.to_string(),
                })?;

        runtime.lifecycle.transition(ChannelLifecycle::Stopping)?;
        tracing::info!("Stopping channel {}", key);

        // No more chunks can be published once this returns.
        runtime.capture.stop();
        self.metrics
            .add_dropped_chunks(runtime.fanout.dropped_total());

        let drain = self.config.drain_timeout();
        let reached = runtime.fanout.finish(drain);
        let consumers = runtime.fanout.consumer_count();
        if reached < consumers {
            tracing::warn!(
                "End-of-stream marker missed {} consumer(s) for {}",
                consumers - reached,
                key
            );
        }

        // Both workers share one drain deadline.
        let deadline = Instant::now() + drain;
        let analysis_done = runtime.analysis.join_timeout(drain);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let tap_done = runtime.tap.join_timeout(remaining);

        let clean = analysis_done && tap_done;
        if !clean {
            self.metrics.increment_shutdown_timeouts();
            tracing::warn!(
                "Channel {} workers did not drain within {:?}, leaving cancel flag set",
                key,
                drain
            );
        }

        runtime.lifecycle.transition(ChannelLifecycle::Stopped)?;
        self.emit(PipelineEvent::ChannelStopped {
            channel: key.to_string(),
            clean,
        });

        Ok(if clean {
            StopOutcome::Clean
        } else {
            StopOutcome::TimedOut
        })
    }

    /// Asks the channel's analysis worker to publish a snapshot of its
    /// pending, not-yet-windowed samples as a buffer event.
    pub fn get_buffer(&self, key: &ChannelKey) -> Result<(), PipelineError> {
        let runtime = self
            .channels
            .get(key)
            .ok_or_else(|| PipelineError::ChannelNotActive {
                channel: key.to_string(),
            })?;
        runtime
            .control_tx
            .send(WorkerControl::EmitBuffer)
            .map_err(|_| PipelineError::ChannelNotActive {
                channel: key.to_string(),
            })
    }

    /// Stops every active channel. Failures and drain timeouts are recorded
    /// in the report instead of aborting the remaining channels.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let keys: Vec<ChannelKey> = self.channels.keys().cloned().collect();
        let mut report = ShutdownReport::default();

        for key in keys {
            match self.stop_channel(&key) {
                Ok(StopOutcome::Clean) => report.stopped.push(key),
                Ok(StopOutcome::TimedOut) => report.timed_out.push(key),
                Err(e) => {
                    tracing::error!("Failed to stop channel {}: {}", key, e);
                    report.timed_out.push(key);
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            "Pipeline shut down: {} chunks captured, {} dropped, {} windows analyzed",
            snapshot.chunks_captured,
            snapshot.chunks_dropped,
            snapshot.windows_emitted
        );
        report
    }

    fn make_dumper(&self, key: &ChannelKey) -> Option<WindowDumper> {
        let dir = self.config.dump_dir.as_deref()?;
        match WindowDumper::new(dir, key) {
            Ok(dumper) => Some(dumper),
            Err(e) => {
                tracing::warn!("Window dumping disabled for {}: {}", key, e);
                None
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if !self.events.emit(event) {
            self.metrics.add_sink_dropped(1);
        }
    }
}
