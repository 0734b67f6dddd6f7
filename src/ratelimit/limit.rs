//! Rate limit policies and admission decisions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// The rate limiting algorithms a [`Limit`] can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Algorithm {
    /// Generic cell rate algorithm: a continuous leaky bucket with burst
    /// tolerance, storing one theoretical arrival time per key.
    Gcra,
    /// Exact counting of event timestamps inside a trailing window.
    SlidingWindow,
}

impl Algorithm {
    /// Stable name used in store keys and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Gcra => "gcra",
            Algorithm::SlidingWindow => "sliding_window",
        }
    }

    /// Look up an algorithm by its stable name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gcra" => Ok(Algorithm::Gcra),
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            other => Err(LimiterError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

impl TryFrom<String> for Algorithm {
    type Error = LimiterError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_name(&value)
    }
}

impl From<Algorithm> for String {
    fn from(algorithm: Algorithm) -> Self {
        algorithm.name().to_string()
    }
}

/// An immutable rate limit policy: `rate` events per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub algorithm: Algorithm,
    /// Events admitted per period at the steady rate
    pub rate: u64,
    /// Length of the period; must be non-zero
    pub period: Duration,
    /// Events admissible instantaneously (GCRA only)
    pub burst: u64,
}

impl Limit {
    /// A GCRA limit of `rate` events per `period`, tolerating `burst` events
    /// at once.
    pub fn gcra(rate: u64, period: Duration, burst: u64) -> Self {
        Self {
            algorithm: Algorithm::Gcra,
            rate,
            period,
            burst,
        }
    }

    /// A sliding window limit of `rate` events in any trailing `period`.
    pub fn sliding_window(rate: u64, period: Duration) -> Self {
        Self {
            algorithm: Algorithm::SlidingWindow,
            rate,
            period,
            burst: 0,
        }
    }

    /// GCRA limit per second with burst equal to the rate.
    pub fn per_second(rate: u64) -> Self {
        Self::gcra(rate, Duration::from_secs(1), rate)
    }

    /// GCRA limit per minute with burst equal to the rate.
    pub fn per_minute(rate: u64) -> Self {
        Self::gcra(rate, Duration::from_secs(60), rate)
    }

    /// GCRA limit per hour with burst equal to the rate.
    pub fn per_hour(rate: u64) -> Self {
        Self::gcra(rate, Duration::from_secs(3600), rate)
    }

    /// Check the limit's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(LimiterError::InvalidLimit(format!(
                "{} limit has a zero period",
                self.algorithm
            )));
        }
        Ok(())
    }

    /// Time cost of one event at the steady rate, `None` when the rate is
    /// zero and no event is ever admitted.
    pub fn emission_interval(&self) -> Option<Duration> {
        if self.rate == 0 {
            return None;
        }
        Some(self.period.div_f64(self.rate as f64))
    }
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// The limit that produced this decision
    pub limit: Limit,
    /// The namespaced store key that was checked
    pub key: String,
    /// Whether the event may happen now
    pub allowed: bool,
    /// Events still admissible right now
    pub remaining: u64,
    /// Time until a retry can succeed; `None` when allowed, or when the limit
    /// can never admit anything
    pub retry_after: Option<Duration>,
    /// Time until the key returns to its initial, empty state; `None` when
    /// it already is empty
    pub reset_after: Option<Duration>,
}
