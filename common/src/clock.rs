//! Time source abstraction.
//!
//! Components that enforce time-based policies (ring-buffer age bounds,
//! hourly segment rotation, retention horizons) take a [`Clock`] rather than
//! calling [`SystemTime::now`] directly, so those policies can be tested
//! deterministically with [`MockClock`].

use std::ops::Add;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Current time as nanoseconds since the Unix epoch.
    fn now_nanos(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64
    }

    /// Current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}

/// The real system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A manually-advanced clock for tests.
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read().unwrap()
    }
}

impl MockClock {
    /// Starts at the current system time.
    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    /// Starts at the given offset from the Unix epoch.
    pub fn at_nanos(nanos: u64) -> Self {
        Self::with_time(UNIX_EPOCH + Duration::from_nanos(nanos))
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write().unwrap();
        *now = now.add(duration);
    }

    pub fn set_time(&self, time: SystemTime) {
        *self.now.write().unwrap() = time;
    }
}
