//! Supervisor lifecycle tests against a scripted capture backend.
//! No audio hardware involved: the fake backend feeds chunks through the
//! real fan-out, queues and workers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use popwatch_app::analysis::{AnalysisProvider, EnergySpikeDetector, ShortTimeEnergyExtractor};
use popwatch_app::{
    CommandOutcome, EventSink, PipelineEvent, PipelineSupervisor, StartOutcome, StopOutcome,
    SupervisorCommand,
};
use popwatch_audio::{
    CaptureBackend, CaptureHandle, ChannelKey, ChunkFanout, DeviceInfo, SampleChunk, StreamRequest,
};
use popwatch_foundation::{
    CaptureError, ChannelLifecycle, DeviceOpenError, PipelineConfig, PipelineError,
};

// ─── Fake Backend ───────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum FeedMode {
    /// Publish every chunk, send the end-of-stream sentinel, exit.
    Finite,
    /// Publish every chunk, then idle until stopped. No sentinel; the
    /// supervisor delivers it during stop.
    HoldOpen,
}

#[derive(Clone)]
struct FeedPlan {
    mode: FeedMode,
    chunks: usize,
    chunk_len: usize,
    value: f32,
    /// Chunk index that gets a loud 64-sample burst at its front.
    burst_chunk: Option<usize>,
}

impl Default for FeedPlan {
    fn default() -> Self {
        Self {
            mode: FeedMode::Finite,
            chunks: 0,
            chunk_len: 256,
            value: 0.25,
            burst_chunk: None,
        }
    }
}

struct FakeBackend {
    devices: Vec<DeviceInfo>,
    fail_opens: AtomicUsize,
    plan: FeedPlan,
}

impl FakeBackend {
    fn new(plan: FeedPlan) -> Self {
        Self {
            devices: fake_devices(),
            fail_opens: AtomicUsize::new(0),
            plan,
        }
    }

    fn failing_once(plan: FeedPlan) -> Self {
        Self {
            devices: fake_devices(),
            fail_opens: AtomicUsize::new(1),
            plan,
        }
    }
}

impl CaptureBackend for FakeBackend {
    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }

    fn open(
        &self,
        request: StreamRequest,
        fanout: Arc<ChunkFanout>,
    ) -> Result<CaptureHandle, CaptureError> {
        if self.fail_opens.load(Ordering::SeqCst) > 0 {
            self.fail_opens.fetch_sub(1, Ordering::SeqCst);
            return Err(CaptureError::DeviceOpen(DeviceOpenError::RateNotSupported {
                device: request.key.device_id.clone(),
                rate: request.sample_rate_hz,
            }));
        }

        let plan = self.plan.clone();
        let rate = request.sample_rate_hz;
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let join = thread::spawn(move || {
            for i in 0..plan.chunks {
                if !thread_running.load(Ordering::SeqCst) {
                    return;
                }
                let mut samples = vec![plan.value; plan.chunk_len];
                if plan.burst_chunk == Some(i) {
                    for s in samples.iter_mut().take(64) {
                        *s = 0.9;
                    }
                }
                fanout.publish(&SampleChunk::new(samples, Instant::now(), rate));
            }
            match plan.mode {
                FeedMode::Finite => {
                    fanout.finish(Duration::from_secs(1));
                }
                FeedMode::HoldOpen => {
                    while thread_running.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                }
            }
        });
        Ok(CaptureHandle::new(running, join))
    }
}

fn fake_devices() -> Vec<DeviceInfo> {
    vec![
        DeviceInfo {
            id: "mic".into(),
            name: "mic".into(),
            max_input_channels: 2,
            default_sample_rate: 48_000,
            is_default: true,
        },
        DeviceInfo {
            id: "usb".into(),
            name: "usb".into(),
            max_input_channels: 8,
            default_sample_rate: 44_100,
            is_default: false,
        },
    ]
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        sample_rate_hz: 16_000,
        chunk_size: 256,
        // 1024 samples per analysis window
        window_seconds: 0.064,
        queue_capacity: 64,
        level_interval_ms: 0,
        poll_timeout_ms: 10,
        drain_timeout_ms: 2_000,
        start_timeout_ms: 1_000,
        ..Default::default()
    }
}

fn test_provider() -> AnalysisProvider {
    AnalysisProvider {
        extractor: Arc::new(ShortTimeEnergyExtractor::new(256, 128)),
        detector: Arc::new(EnergySpikeDetector::default()),
    }
}

fn supervisor_with(backend: FakeBackend) -> (PipelineSupervisor, Receiver<PipelineEvent>) {
    let (events, event_rx) = EventSink::bounded(128);
    let supervisor =
        PipelineSupervisor::new(test_config(), Arc::new(backend), test_provider(), events);
    (supervisor, event_rx)
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ─── Validation ─────────────────────────────────────────────────────────────

#[test]
fn start_rejects_out_of_range_channel() {
    let (mut supervisor, _event_rx) = supervisor_with(FakeBackend::new(FeedPlan::default()));
    let key = ChannelKey::new("mic", 5);

    let err = supervisor.start_channel(&key).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::InvalidChannel {
            requested: 5,
            available: 2,
            ..
        })
    ));
    assert!(!supervisor.is_active(&key));
    assert!(supervisor.active_channels().is_empty());
}

#[test]
fn start_rejects_unknown_device() {
    let (mut supervisor, _event_rx) = supervisor_with(FakeBackend::new(FeedPlan::default()));
    let key = ChannelKey::new("missing", 0);

    let err = supervisor.start_channel(&key).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::DeviceOpen(DeviceOpenError::NotFound { .. }))
    ));
}

#[test]
fn second_start_reports_already_active() {
    let plan = FeedPlan {
        mode: FeedMode::HoldOpen,
        ..Default::default()
    };
    let (mut supervisor, _event_rx) = supervisor_with(FakeBackend::new(plan));
    let key = ChannelKey::new("mic", 0);

    assert_eq!(supervisor.start_channel(&key).unwrap(), StartOutcome::Started);
    assert_eq!(supervisor.lifecycle(&key), Some(ChannelLifecycle::Running));
    assert_eq!(
        supervisor.start_channel(&key).unwrap(),
        StartOutcome::AlreadyActive
    );
    assert_eq!(supervisor.active_channels().len(), 1);

    supervisor.shutdown();
}

// ─── Start Failure Rollback ─────────────────────────────────────────────────

#[test]
fn failed_open_rolls_back_and_allows_retry() {
    let plan = FeedPlan {
        mode: FeedMode::HoldOpen,
        ..Default::default()
    };
    let (mut supervisor, _event_rx) = supervisor_with(FakeBackend::failing_once(plan));
    let key = ChannelKey::new("mic", 0);

    let err = supervisor.start_channel(&key).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::DeviceOpen(
            DeviceOpenError::RateNotSupported { .. }
        ))
    ));
    assert!(!supervisor.is_active(&key));
    assert_eq!(supervisor.lifecycle(&key), None);

    // The failed start left nothing behind, so a retry goes through.
    assert_eq!(supervisor.start_channel(&key).unwrap(), StartOutcome::Started);
    supervisor.shutdown();
}

// ─── Event Flow ─────────────────────────────────────────────────────────────

#[test]
fn running_channel_produces_levels_windows_and_taps() {
    let plan = FeedPlan {
        mode: FeedMode::Finite,
        chunks: 8,
        ..Default::default()
    };
    let (mut supervisor, event_rx) = supervisor_with(FakeBackend::new(plan));
    let key = ChannelKey::new("mic", 0);
    let metrics = supervisor.metrics();

    assert_eq!(supervisor.start_channel(&key).unwrap(), StartOutcome::Started);

    // 8 chunks of 256 samples complete two 1024-sample windows.
    assert!(wait_until(Duration::from_secs(3), || {
        metrics.snapshot().windows_emitted == 2
    }));
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.chunks_captured, 8);
    assert_eq!(snapshot.windows_discarded, 0);
    assert_eq!(snapshot.anomaly_events, 0);

    assert_eq!(supervisor.stop_channel(&key).unwrap(), StopOutcome::Clean);

    let events: Vec<PipelineEvent> = event_rx.try_iter().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::ChannelStarted { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::LevelUpdate { .. })));
    let taps = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::BufferData { .. }))
        .count();
    assert_eq!(taps, 8);
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::ChannelStopped { clean: true, .. })));
}

#[test]
fn spike_in_feed_raises_anomaly_event() {
    let plan = FeedPlan {
        mode: FeedMode::Finite,
        chunks: 4,
        value: 0.01,
        burst_chunk: Some(0),
        ..Default::default()
    };
    let (mut supervisor, event_rx) = supervisor_with(FakeBackend::new(plan));
    let key = ChannelKey::new("mic", 0);
    let metrics = supervisor.metrics();

    supervisor.start_channel(&key).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        metrics.snapshot().anomaly_events == 1
    }));
    assert_eq!(metrics.snapshot().windows_emitted, 1);

    supervisor.stop_channel(&key).unwrap();
    let anomaly = event_rx.try_iter().find_map(|e| match e {
        PipelineEvent::AnomalyDetected {
            channel,
            window_rms,
            ..
        } => Some((channel, window_rms)),
        _ => None,
    });
    let (channel, window_rms) = anomaly.expect("anomaly event missing");
    assert_eq!(channel, "mic:0");
    assert!(window_rms > 0.0);
}

// ─── Buffer Requests ────────────────────────────────────────────────────────

#[test]
fn get_buffer_snapshots_pending_samples() {
    // Two chunks land and the feed idles, leaving 512 samples pending.
    let plan = FeedPlan {
        mode: FeedMode::HoldOpen,
        chunks: 2,
        ..Default::default()
    };
    let (mut supervisor, event_rx) = supervisor_with(FakeBackend::new(plan));
    let key = ChannelKey::new("mic", 0);
    let metrics = supervisor.metrics();

    supervisor.start_channel(&key).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        metrics.snapshot().chunks_captured == 2
    }));

    supervisor.get_buffer(&key).unwrap();

    // Tap events carry one 256-sample chunk each; the pending snapshot is
    // the concatenation of both.
    let mut seen = Vec::new();
    assert!(wait_until(Duration::from_secs(3), || {
        seen.extend(event_rx.try_iter());
        seen.iter().any(
            |e| matches!(e, PipelineEvent::BufferData { samples, .. } if samples.len() == 512),
        )
    }));

    // Stop delivers the sentinel; the 512-sample remainder becomes the
    // final short window.
    assert_eq!(supervisor.stop_channel(&key).unwrap(), StopOutcome::Clean);
    assert_eq!(metrics.snapshot().windows_emitted, 1);
}

#[test]
fn buffer_request_for_inactive_channel_fails() {
    let (supervisor, _event_rx) = supervisor_with(FakeBackend::new(FeedPlan::default()));
    let key = ChannelKey::new("mic", 0);

    assert!(matches!(
        supervisor.get_buffer(&key),
        Err(PipelineError::ChannelNotActive { .. })
    ));
}

#[test]
fn stop_of_inactive_channel_fails() {
    let (mut supervisor, _event_rx) = supervisor_with(FakeBackend::new(FeedPlan::default()));
    let key = ChannelKey::new("mic", 1);

    assert!(matches!(
        supervisor.stop_channel(&key),
        Err(PipelineError::ChannelNotActive { .. })
    ));
}

// ─── Shutdown ───────────────────────────────────────────────────────────────

#[test]
fn shutdown_stops_every_active_channel() {
    let plan = FeedPlan {
        mode: FeedMode::HoldOpen,
        chunks: 4,
        ..Default::default()
    };
    let (mut supervisor, event_rx) = supervisor_with(FakeBackend::new(plan));
    let mic = ChannelKey::new("mic", 0);
    let usb = ChannelKey::new("usb", 3);

    supervisor.start_channel(&mic).unwrap();
    supervisor.start_channel(&usb).unwrap();
    assert_eq!(supervisor.active_channels().len(), 2);

    let report = supervisor.shutdown();
    assert!(report.is_clean());
    assert_eq!(report.stopped.len(), 2);
    assert!(supervisor.active_channels().is_empty());

    let stopped = event_rx
        .try_iter()
        .filter(|e| matches!(e, PipelineEvent::ChannelStopped { clean: true, .. }))
        .count();
    assert_eq!(stopped, 2);

    // Nothing left to stop the second time around.
    let report = supervisor.shutdown();
    assert!(report.stopped.is_empty() && report.timed_out.is_empty());
}

// ─── Command Dispatch ───────────────────────────────────────────────────────

#[test]
fn commands_map_to_lifecycle_operations() {
    let plan = FeedPlan {
        mode: FeedMode::HoldOpen,
        chunks: 2,
        ..Default::default()
    };
    let (mut supervisor, _event_rx) = supervisor_with(FakeBackend::new(plan));
    let key = ChannelKey::new("mic", 0);

    let outcome = supervisor
        .handle(SupervisorCommand::StartChannel { key: key.clone() })
        .unwrap();
    assert_eq!(outcome, CommandOutcome::Started(StartOutcome::Started));

    let outcome = supervisor
        .handle(SupervisorCommand::GetBuffer { key: key.clone() })
        .unwrap();
    assert_eq!(outcome, CommandOutcome::BufferRequested);

    let outcome = supervisor.handle(SupervisorCommand::Shutdown).unwrap();
    match outcome {
        CommandOutcome::ShutdownComplete(report) => assert!(report.is_clean()),
        other => panic!("unexpected outcome: {:?}", other),
    }
}
