//! Clock abstraction so rate-limited emission logic can run on virtual time
//! in tests.

use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Real-time clock implementation
pub struct RealClock;

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RealClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Virtual clock for deterministic testing
pub struct TestClock {
    current_time: parking_lot::Mutex<Instant>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            current_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Advance the virtual clock by the specified duration
    pub fn advance(&self, duration: Duration) {
        *self.current_time.lock() += duration;
    }

    /// Set the virtual clock to a specific time
    pub fn set_time(&self, time: Instant) {
        *self.current_time.lock() = time;
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.current_time.lock()
    }
}

/// Thread-safe clock handle shared across workers
pub type SharedClock = std::sync::Arc<dyn Clock + Send + Sync>;

pub fn real_clock() -> SharedClock {
    std::sync::Arc::new(RealClock::new())
}
