//! Integration tests for foundation primitives: channel lifecycle
//! transitions, the virtual clock, configuration loading, and the
//! shutdown guard.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use popwatch_foundation::{
    ChannelLifecycle, Clock, LifecycleCell, PipelineConfig, PipelineError, ShutdownHandler,
    TestClock,
};

// ─── Lifecycle Tests ───

#[test]
fn lifecycle_follows_full_start_stop_cycle() {
    let cell = LifecycleCell::new();
    assert_eq!(cell.current(), ChannelLifecycle::Stopped);

    cell.transition(ChannelLifecycle::Starting).unwrap();
    cell.transition(ChannelLifecycle::Running).unwrap();
    cell.transition(ChannelLifecycle::Stopping).unwrap();
    cell.transition(ChannelLifecycle::Stopped).unwrap();
    assert_eq!(cell.current(), ChannelLifecycle::Stopped);
}

#[test]
fn lifecycle_rejects_skipped_states() {
    let cell = LifecycleCell::new();

    let err = cell.transition(ChannelLifecycle::Running).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            from: ChannelLifecycle::Stopped,
            to: ChannelLifecycle::Running,
        }
    ));

    // A failed transition leaves the state untouched
    assert_eq!(cell.current(), ChannelLifecycle::Stopped);
}

#[test]
fn starting_falls_back_to_stopped_on_failure() {
    let cell = LifecycleCell::new();
    cell.transition(ChannelLifecycle::Starting).unwrap();
    cell.transition(ChannelLifecycle::Stopped).unwrap();
    assert_eq!(cell.current(), ChannelLifecycle::Stopped);
}

#[test]
fn running_cannot_jump_straight_to_stopped() {
    let cell = LifecycleCell::new();
    cell.transition(ChannelLifecycle::Starting).unwrap();
    cell.transition(ChannelLifecycle::Running).unwrap();
    assert!(cell.transition(ChannelLifecycle::Stopped).is_err());
    assert_eq!(cell.current(), ChannelLifecycle::Running);
}

#[test]
fn subscribers_observe_transition_sequence() {
    let cell = LifecycleCell::new();
    let rx = cell.subscribe();

    cell.transition(ChannelLifecycle::Starting).unwrap();
    cell.transition(ChannelLifecycle::Running).unwrap();

    assert_eq!(rx.try_recv().unwrap(), ChannelLifecycle::Starting);
    assert_eq!(rx.try_recv().unwrap(), ChannelLifecycle::Running);
    assert!(rx.try_recv().is_err());
}

// ─── Clock Tests ───

#[test]
fn test_clock_advances_without_wall_time() {
    let clock = TestClock::new();
    let start = clock.now();

    clock.advance(Duration::from_millis(150));
    assert_eq!(clock.now().duration_since(start), Duration::from_millis(150));

    clock.advance(Duration::from_secs(2));
    assert_eq!(
        clock.now().duration_since(start),
        Duration::from_millis(2_150)
    );
}

#[test]
fn test_clock_set_time_jumps_directly() {
    let clock = TestClock::new();
    let target = Instant::now() + Duration::from_secs(30);
    clock.set_time(target);
    assert_eq!(clock.now(), target);
}

// ─── Config Tests ───

#[test]
fn config_defaults_when_no_file_given() {
    let cfg = PipelineConfig::load(None).unwrap();
    assert_eq!(cfg.sample_rate_hz, 16_000);
    assert_eq!(cfg.chunk_size, 1024);
    assert_eq!(cfg.queue_capacity, 200);
    assert_eq!(cfg.target_samples(), 32_000);
}

#[test]
fn config_file_overrides_defaults() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    writeln!(file, "sample_rate_hz = 48000").unwrap();
    writeln!(file, "chunk_size = 2048").unwrap();
    writeln!(file, "window_seconds = 1.0").unwrap();
    file.flush().unwrap();

    let cfg = PipelineConfig::load(Some(file.path())).unwrap();
    assert_eq!(cfg.sample_rate_hz, 48_000);
    assert_eq!(cfg.chunk_size, 2048);
    assert_eq!(cfg.target_samples(), 48_000);
    // Untouched fields keep their defaults
    assert_eq!(cfg.queue_capacity, 200);
    assert_eq!(cfg.level_interval_ms, 100);
}

#[test]
fn config_file_with_invalid_values_is_rejected() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    writeln!(file, "chunk_size = 0").unwrap();
    file.flush().unwrap();

    assert!(PipelineConfig::load(Some(file.path())).is_err());
}

// ─── Shutdown Tests ───

#[tokio::test]
async fn wait_returns_when_shutdown_was_already_requested() {
    let guard = ShutdownHandler::new().install().await;
    assert!(!guard.is_shutdown_requested());

    guard.request_shutdown();
    assert!(guard.is_shutdown_requested());
    // Must not hang even though the request landed before the wait.
    tokio::time::timeout(Duration::from_secs(1), guard.wait())
        .await
        .unwrap();
}

#[tokio::test]
async fn request_shutdown_wakes_a_parked_waiter() {
    let guard = Arc::new(ShutdownHandler::new().install().await);
    let waiter = Arc::clone(&guard);
    let handle = tokio::spawn(async move { waiter.wait().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    guard.request_shutdown();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
