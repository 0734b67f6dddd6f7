//! Store-side clock sources.
//!
//! Timestamps handed to the algorithms are seconds since the store epoch,
//! with microsecond resolution, as a single `f64`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use super::{StoreError, StoreResult, PRECISION_HORIZON_UNIX_SECS, STORE_EPOCH_UNIX_SECS};

/// Smallest time step the store clock can express.
pub const CLOCK_RESOLUTION_SECS: f64 = 0.000_001;

/// Clock abstraction so store time can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Time elapsed since the unix epoch.
    fn now(&self) -> Duration;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        let now = Utc::now();
        let secs = u64::try_from(now.timestamp()).unwrap_or(0);
        Duration::from_secs(secs) + Duration::from_micros(u64::from(now.timestamp_subsec_micros()))
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Create a clock frozen at `unix` (time since the unix epoch).
    pub fn new(unix: Duration) -> Self {
        Self {
            now: Arc::new(Mutex::new(unix)),
        }
    }

    pub fn set(&self, unix: Duration) {
        *self.now.lock() = unix;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    /// 2024-01-01T00:00:00Z
    fn default() -> Self {
        Self::new(Duration::from_secs(1_704_067_200))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// Convert a unix time into store seconds.
///
/// Fails once the clock passes the precision horizon, where the combined
/// seconds + microseconds value no longer fits a double exactly.
pub fn store_seconds(unix: Duration) -> StoreResult<f64> {
    let secs = unix.as_secs();
    if secs > PRECISION_HORIZON_UNIX_SECS {
        return Err(StoreError::ClockHorizon(secs));
    }
    let adjusted = secs.saturating_sub(STORE_EPOCH_UNIX_SECS) as f64;
    Ok(adjusted + f64::from(unix.subsec_micros()) / 1_000_000.0)
}
