use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use popwatch_app::analysis::AnalysisProvider;
use popwatch_app::{EventSink, PipelineEvent, PipelineSupervisor};
use popwatch_audio::{CaptureBackend, ChannelKey, CpalBackend};
use popwatch_foundation::{PipelineConfig, RecoveryStrategy, ShutdownHandler};

#[derive(Parser)]
#[command(name = "popwatch")]
#[command(version)]
#[command(about = "Per-channel audio capture and anomaly monitoring pipeline")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Input device name; defaults to the system default input
    #[arg(short = 'D', long, env = "POPWATCH_DEVICE")]
    device: Option<String>,

    /// Channel index to capture from the device
    #[arg(short = 'c', long, default_value = "0")]
    channel: u16,

    /// Override the configured sample rate
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Override the samples-per-chunk callback quantum
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Override the analysis window length in seconds
    #[arg(long)]
    window_seconds: Option<f32>,

    /// Override the per-consumer queue capacity in chunks
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Override the minimum spacing between level updates, in milliseconds
    #[arg(long)]
    level_interval_ms: Option<u64>,

    /// Write each analysis window to this directory as WAV
    #[arg(long)]
    dump_windows: Option<PathBuf>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all("logs")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "popwatch.log");
    let (non_blocking_file, _guard) = tracing_appender::non_blocking(file_appender);
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();
    std::mem::forget(_guard);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;
    let cli = Cli::parse();

    let backend: Arc<dyn CaptureBackend> = Arc::new(CpalBackend::new());

    if cli.list_devices {
        list_devices(backend.as_ref());
        return Ok(());
    }

    tracing::info!("Starting popwatch pipeline");

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(rate) = cli.sample_rate {
        config.sample_rate_hz = rate;
    }
    if let Some(size) = cli.chunk_size {
        config.chunk_size = size;
    }
    if let Some(seconds) = cli.window_seconds {
        config.window_seconds = seconds;
    }
    if let Some(capacity) = cli.queue_capacity {
        config.queue_capacity = capacity;
    }
    if let Some(interval) = cli.level_interval_ms {
        config.level_interval_ms = interval;
    }
    if let Some(dir) = cli.dump_windows {
        config.dump_dir = Some(dir);
    }
    config.validate()?;

    let device = match cli.device {
        Some(device) => device,
        None => default_device(backend.as_ref())?,
    };
    let key = ChannelKey::new(device, cli.channel);

    let (events, event_rx) = EventSink::bounded(256);
    let printer = std::thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || print_events(event_rx))?;

    let shutdown = ShutdownHandler::new().install().await;

    let mut supervisor = PipelineSupervisor::new(
        config,
        Arc::clone(&backend),
        AnalysisProvider::default(),
        events,
    );
    start_with_recovery(&mut supervisor, backend.as_ref(), key).await?;
    let metrics = supervisor.metrics();

    let mut stats_interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = stats_interval.tick() => {
                let snapshot = metrics.snapshot();
                tracing::info!(
                    "Pipeline running: {} chunks captured, {} dropped, {} windows, {} anomalies",
                    snapshot.chunks_captured,
                    snapshot.chunks_dropped,
                    snapshot.windows_emitted,
                    snapshot.anomaly_events
                );
            }
        }
    }

    tracing::info!("Beginning graceful shutdown");
    let report = supervisor.shutdown();
    if !report.is_clean() {
        tracing::warn!(
            "Channels timed out during shutdown: {:?}",
            report.timed_out
        );
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        "Final counts: {} chunks captured, {} dropped, {} windows analyzed, {} discarded, {} anomalies",
        snapshot.chunks_captured,
        snapshot.chunks_dropped,
        snapshot.windows_emitted,
        snapshot.windows_discarded,
        snapshot.anomaly_events
    );

    // Last event sender goes away with the supervisor, ending the printer.
    drop(supervisor);
    if printer.join().is_err() {
        tracing::error!("Event printer thread panicked");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Starts the channel, following the error's recovery strategy: transient
/// failures retry with a delay, a missing device falls back to the default
/// input once, anything else aborts startup.
async fn start_with_recovery(
    supervisor: &mut PipelineSupervisor,
    backend: &dyn CaptureBackend,
    mut key: ChannelKey,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut attempts = 0u32;
    let mut fell_back = false;
    loop {
        let err = match supervisor.start_channel(&key) {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        match err.recovery_strategy() {
            RecoveryStrategy::Retry {
                max_attempts,
                delay,
            } => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(anyhow!(
                        "Giving up on {} after {} attempts: {}",
                        key,
                        attempts,
                        err
                    )
                    .into());
                }
                tracing::warn!(
                    "Start attempt {} for {} failed: {}; retrying in {:?}",
                    attempts,
                    key,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            RecoveryStrategy::Fallback { .. } if !fell_back => {
                fell_back = true;
                let device = default_device(backend)?;
                tracing::warn!(
                    "Device '{}' unavailable, falling back to default input '{}'",
                    key.device_id,
                    device
                );
                key = ChannelKey::new(device, key.channel_index);
            }
            _ => return Err(err.into()),
        }
    }
}

fn default_device(backend: &dyn CaptureBackend) -> Result<String, Box<dyn std::error::Error>> {
    let devices = backend.devices();
    devices
        .iter()
        .find(|d| d.is_default)
        .or_else(|| devices.first())
        .map(|d| d.id.clone())
        .ok_or_else(|| anyhow!("No input devices available").into())
}

fn list_devices(backend: &dyn CaptureBackend) {
    let devices = backend.devices();
    if devices.is_empty() {
        println!("No input devices available");
        return;
    }
    println!("Input devices:");
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!(
            "  {}{}  [{} channels, {} Hz]",
            device.id, marker, device.max_input_channels, device.default_sample_rate
        );
    }
}

/// Buffer payloads are summarized; every other event goes to stdout as one
/// JSON line.
fn print_events(rx: crossbeam_channel::Receiver<PipelineEvent>) {
    for event in rx.iter() {
        match &event {
            PipelineEvent::BufferData {
                channel,
                sample_rate,
                samples,
            } => {
                tracing::info!(
                    "Buffer snapshot for {}: {} samples at {} Hz",
                    channel,
                    samples.len(),
                    sample_rate
                );
            }
            _ => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            },
        }
    }
}
