use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use crossbeam_channel::bounded;
use parking_lot::RwLock;

use popwatch_foundation::{CaptureError, DeviceOpenError};

use crate::chunk::SampleChunk;
use crate::device::StreamRequest;
use crate::fanout::ChunkFanout;

/// Handle to one channel's capture thread. Dropping it stops the stream.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<CaptureStats>,
}

impl CaptureHandle {
    /// Wraps an externally spawned capture loop. The thread must exit soon
    /// after `running` goes false.
    pub fn new(running: Arc<AtomicBool>, join: JoinHandle<()>) -> Self {
        Self {
            running,
            join: Some(join),
            stats: Arc::new(CaptureStats::default()),
        }
    }

    fn with_stats(running: Arc<AtomicBool>, join: JoinHandle<()>, stats: Arc<CaptureStats>) -> Self {
        Self {
            running,
            join: Some(join),
            stats,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals the thread and waits for it to release the stream. Safe to
    /// call more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("Capture thread panicked during shutdown");
            }
        }
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
pub struct CaptureStats {
    pub callbacks: AtomicU64,
    pub chunks_built: AtomicU64,
    pub stream_errors: AtomicU64,
    pub last_callback: RwLock<Option<Instant>>,
}

impl CaptureStats {
    fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            chunks_built: self.chunks_built.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
            last_callback_age: self
                .last_callback
                .read()
                .map(|t| Instant::now().duration_since(t)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureStatsSnapshot {
    pub callbacks: u64,
    pub chunks_built: u64,
    pub stream_errors: u64,
    pub last_callback_age: Option<Duration>,
}

struct StreamInfo {
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

/// Spawns the dedicated thread that owns the cpal stream and blocks until
/// the stream is live or the start timeout expires.
pub(crate) fn spawn_stream(
    request: StreamRequest,
    fanout: Arc<ChunkFanout>,
) -> Result<CaptureHandle, CaptureError> {
    spawn_with_opener(request, fanout, open_stream)
}

/// Spawn-and-handshake core. `opener` runs on the new thread and returns a
/// guard that keeps the stream alive until dropped.
fn spawn_with_opener<S, O>(
    request: StreamRequest,
    fanout: Arc<ChunkFanout>,
    opener: O,
) -> Result<CaptureHandle, CaptureError>
where
    S: 'static,
    O: FnOnce(
            &StreamRequest,
            Arc<ChunkFanout>,
            Arc<AtomicBool>,
            Arc<CaptureStats>,
        ) -> Result<(S, StreamInfo), CaptureError>
        + Send
        + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(CaptureStats::default());
    let (ready_tx, ready_rx) = bounded::<Result<StreamInfo, CaptureError>>(1);

    let thread_running = Arc::clone(&running);
    let thread_stats = Arc::clone(&stats);
    let thread_request = request.clone();
    let join = thread::Builder::new()
        .name(format!("capture-{}", request.key))
        .spawn(move || {
            run_stream(thread_request, fanout, thread_running, thread_stats, ready_tx, opener)
        })
        .map_err(|e| CaptureError::Fatal(format!("Failed to spawn capture thread: {}", e)))?;

    match ready_rx.recv_timeout(request.start_timeout) {
        Ok(Ok(info)) => {
            tracing::info!(
                "Capture started for {} on '{}' ({} Hz, {} channels)",
                request.key,
                info.device_name,
                info.sample_rate,
                info.channels
            );
            Ok(CaptureHandle::with_stats(running, join, stats))
        }
        Ok(Err(e)) => {
            // The open call has already returned, so this join is prompt.
            let _ = join.join();
            Err(e)
        }
        Err(_) => {
            // The opener may still be blocked inside the audio backend. Do
            // not join; the cleared flag and the dropped ready channel make
            // the thread exit on its own once the backend call returns.
            running.store(false, Ordering::SeqCst);
            drop(join);
            Err(CaptureError::StartTimeout {
                timeout: request.start_timeout,
            })
        }
    }
}

/// Thread body. cpal handles are not Send, so the host, device and stream
/// live entirely here.
fn run_stream<S>(
    request: StreamRequest,
    fanout: Arc<ChunkFanout>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    ready_tx: crossbeam_channel::Sender<Result<StreamInfo, CaptureError>>,
    opener: impl FnOnce(
        &StreamRequest,
        Arc<ChunkFanout>,
        Arc<AtomicBool>,
        Arc<CaptureStats>,
    ) -> Result<(S, StreamInfo), CaptureError>,
) {
    let key = request.key.clone();
    match opener(&request, fanout, Arc::clone(&running), stats) {
        Ok((stream, info)) => {
            if ready_tx.send(Ok(info)).is_err() {
                // Spawner gave up waiting. Tear the stream down.
                return;
            }
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(100));
            }
            drop(stream);
            tracing::debug!("Capture thread for {} exited", key);
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

fn open_stream(
    request: &StreamRequest,
    fanout: Arc<ChunkFanout>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
) -> Result<(Stream, StreamInfo), CaptureError> {
    let host = cpal::default_host();
    let device = find_device(&host, &request.key.device_id)?;
    let device_name = device
        .name()
        .unwrap_or_else(|_| request.key.device_id.clone());

    let (config, sample_format) = negotiate_config(&device, request.sample_rate_hz)?;
    let channels = config.channels;

    // Enumeration already screened the index; the opened config is
    // authoritative.
    if request.key.channel_index >= channels {
        return Err(CaptureError::InvalidChannel {
            device: device_name,
            requested: request.key.channel_index,
            available: channels,
        });
    }

    let mut assembler = ChunkAssembler::new(
        request.key.channel_index as usize,
        channels as usize,
        request.chunk_size,
        config.sample_rate.0,
        fanout,
        Arc::clone(&stats),
        running,
    );

    let err_stats = stats;
    let err_fn = move |err: cpal::StreamError| {
        err_stats.stream_errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!("Audio stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &_| assembler.extend_from(data, i16_to_f32),
            err_fn,
            None,
        ),
        SampleFormat::I32 => device.build_input_stream(
            &config,
            move |data: &[i32], _: &_| assembler.extend_from(data, i32_to_f32),
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &_| assembler.extend_from(data, u16_to_f32),
            err_fn,
            None,
        ),
        SampleFormat::U32 => device.build_input_stream(
            &config,
            move |data: &[u32], _: &_| assembler.extend_from(data, u32_to_f32),
            err_fn,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &_| assembler.extend_from(data, |s| s.clamp(-1.0, 1.0)),
            err_fn,
            None,
        ),
        SampleFormat::F64 => device.build_input_stream(
            &config,
            move |data: &[f64], _: &_| {
                assembler.extend_from(data, |s| s.clamp(-1.0, 1.0) as f32)
            },
            err_fn,
            None,
        ),
        other => {
            return Err(DeviceOpenError::FormatNotSupported {
                format: format!("{:?}", other),
            }
            .into())
        }
    }
    .map_err(DeviceOpenError::from)?;

    stream.play().map_err(DeviceOpenError::from)?;

    let info = StreamInfo {
        device_name,
        sample_rate: config.sample_rate.0,
        channels,
    };
    Ok((stream, info))
}

fn find_device(host: &cpal::Host, device_id: &str) -> Result<cpal::Device, DeviceOpenError> {
    let mut devices = host.input_devices()?;
    devices
        .find(|d| d.name().map(|n| n == device_id).unwrap_or(false))
        .ok_or_else(|| DeviceOpenError::NotFound {
            name: Some(device_id.to_string()),
        })
}

/// Picks a config running at exactly the requested rate. There is no
/// resampling downstream, so a device that cannot do the rate is an error.
fn negotiate_config(
    device: &cpal::Device,
    rate: u32,
) -> Result<(StreamConfig, SampleFormat), DeviceOpenError> {
    if let Ok(default) = device.default_input_config() {
        if default.sample_rate().0 == rate {
            return Ok((
                StreamConfig {
                    channels: default.channels(),
                    sample_rate: default.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                },
                default.sample_format(),
            ));
        }
    }

    let supported = device.supported_input_configs()?;
    for range in supported {
        if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
            let config = range.with_sample_rate(SampleRate(rate));
            return Ok((
                StreamConfig {
                    channels: config.channels(),
                    sample_rate: config.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                },
                config.sample_format(),
            ));
        }
    }

    Err(DeviceOpenError::RateNotSupported {
        device: device.name().unwrap_or_else(|_| "unknown".to_string()),
        rate,
    })
}

/// Pulls one channel out of interleaved frames and publishes fixed-size
/// chunks. Lives inside the stream callback.
struct ChunkAssembler {
    channel_index: usize,
    stride: usize,
    chunk_size: usize,
    sample_rate: u32,
    buf: Vec<f32>,
    fanout: Arc<ChunkFanout>,
    stats: Arc<CaptureStats>,
    running: Arc<AtomicBool>,
}

impl ChunkAssembler {
    fn new(
        channel_index: usize,
        stride: usize,
        chunk_size: usize,
        sample_rate: u32,
        fanout: Arc<ChunkFanout>,
        stats: Arc<CaptureStats>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            channel_index,
            stride,
            chunk_size,
            sample_rate,
            buf: Vec::with_capacity(chunk_size),
            fanout,
            stats,
            running,
        }
    }

    fn extend_from<T, F>(&mut self, data: &[T], convert: F)
    where
        T: Copy,
        F: Fn(T) -> f32,
    {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
        for &raw in data.iter().skip(self.channel_index).step_by(self.stride) {
            self.buf.push(convert(raw));
            if self.buf.len() == self.chunk_size {
                self.emit();
            }
        }
        *self.stats.last_callback.write() = Some(Instant::now());
    }

    fn emit(&mut self) {
        let samples = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        let chunk = SampleChunk::new(samples, Instant::now(), self.sample_rate);
        self.fanout.publish(&chunk);
        self.stats.chunks_built.fetch_add(1, Ordering::Relaxed);
    }
}

fn i16_to_f32(s: i16) -> f32 {
    s as f32 / 32768.0
}

fn i32_to_f32(s: i32) -> f32 {
    (s as f64 / 2_147_483_648.0) as f32
}

fn u16_to_f32(s: u16) -> f32 {
    (s as f32 - 32768.0) / 32768.0
}

fn u32_to_f32(s: u32) -> f32 {
    ((s as f64 - 2_147_483_648.0) / 2_147_483_648.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChannelKey;
    use crate::queue::{QueueMessage, SampleQueue};

    fn request(start_timeout: Duration) -> StreamRequest {
        StreamRequest {
            key: ChannelKey::new("mic", 0),
            sample_rate_hz: 16_000,
            chunk_size: 512,
            start_timeout,
        }
    }

    fn info() -> StreamInfo {
        StreamInfo {
            device_name: "mic".to_string(),
            sample_rate: 16_000,
            channels: 1,
        }
    }

    #[test]
    fn integer_conversions_hit_expected_range() {
        assert_eq!(i16_to_f32(0), 0.0);
        assert_eq!(i16_to_f32(i16::MIN), -1.0);
        assert!((i16_to_f32(i16::MAX) - 1.0).abs() < 1e-3);

        assert_eq!(u16_to_f32(32768), 0.0);
        assert_eq!(u16_to_f32(0), -1.0);

        assert_eq!(i32_to_f32(i32::MIN), -1.0);
        assert_eq!(u32_to_f32(2_147_483_648), 0.0);
        assert_eq!(u32_to_f32(0), -1.0);
    }

    #[test]
    fn assembler_demuxes_one_channel_from_interleaved_frames() {
        let fanout = Arc::new(ChunkFanout::new());
        let (tx, rx) = SampleQueue::bounded("test", 8);
        fanout.register(tx);

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());
        let mut assembler = ChunkAssembler::new(
            1,
            2,
            4,
            16_000,
            Arc::clone(&fanout),
            stats,
            running,
        );

        // Stereo frames: left is 100*n, right is n.
        let data: Vec<i16> = (0..8).flat_map(|n| [n * 100, n]).collect();
        assembler.extend_from(&data, i16_to_f32);

        let msg = rx.try_recv().unwrap();
        let QueueMessage::Chunk(chunk) = msg else {
            panic!("expected a chunk");
        };
        assert_eq!(chunk.len(), 4);
        for (i, sample) in chunk.samples.iter().enumerate() {
            assert!((sample - i16_to_f32(i as i16)).abs() < 1e-6);
        }
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, QueueMessage::Chunk(c) if c.len() == 4));
    }

    #[test]
    fn assembler_carries_partial_chunk_across_callbacks() {
        let fanout = Arc::new(ChunkFanout::new());
        let (tx, rx) = SampleQueue::bounded("test", 8);
        fanout.register(tx);

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());
        let mut assembler =
            ChunkAssembler::new(0, 1, 4, 16_000, Arc::clone(&fanout), stats, running);

        assembler.extend_from(&[1i16, 2, 3], i16_to_f32);
        assert!(rx.try_recv().is_none());

        assembler.extend_from(&[4i16, 5], i16_to_f32);
        let QueueMessage::Chunk(chunk) = rx.try_recv().unwrap() else {
            panic!("expected a chunk");
        };
        assert_eq!(chunk.len(), 4);
    }

    #[test]
    fn assembler_stops_when_flag_clears() {
        let fanout = Arc::new(ChunkFanout::new());
        let (tx, rx) = SampleQueue::bounded("test", 8);
        fanout.register(tx);

        let running = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CaptureStats::default());
        let mut assembler = ChunkAssembler::new(
            0,
            1,
            2,
            16_000,
            Arc::clone(&fanout),
            Arc::clone(&stats),
            running,
        );

        assembler.extend_from(&[1i16, 2, 3, 4], i16_to_f32);
        assert!(rx.try_recv().is_none());
        assert_eq!(stats.callbacks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn handle_stop_is_idempotent() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let join = thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        });
        let mut handle = CaptureHandle::new(running, join);
        assert!(handle.is_running());
        handle.stop();
        assert!(!handle.is_running());
        handle.stop();
    }

    #[test]
    fn start_timeout_fires_while_open_is_still_blocked() {
        let fanout = Arc::new(ChunkFanout::new());
        let release = Arc::new(AtomicBool::new(false));
        let opener_release = Arc::clone(&release);

        let started = Instant::now();
        let result = spawn_with_opener(
            request(Duration::from_millis(50)),
            fanout,
            move |_, _, _, _| {
                while !opener_release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(((), info()))
            },
        );

        assert!(matches!(result, Err(CaptureError::StartTimeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(500));
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn late_open_releases_the_stream_after_start_times_out() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let fanout = Arc::new(ChunkFanout::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let guard_dropped = Arc::clone(&dropped);

        let result = spawn_with_opener(
            request(Duration::from_millis(10)),
            fanout,
            move |_, _, _, _| {
                thread::sleep(Duration::from_millis(60));
                Ok((DropFlag(guard_dropped), info()))
            },
        );
        assert!(matches!(result, Err(CaptureError::StartTimeout { .. })));

        let deadline = Instant::now() + Duration::from_secs(2);
        while !dropped.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "stream guard never released");
            thread::sleep(Duration::from_millis(5));
        }
    }
}
