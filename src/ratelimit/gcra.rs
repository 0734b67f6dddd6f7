//! GCRA (generic cell rate algorithm) engine.
//!
//! The bucket is described by one scalar per key, the theoretical arrival
//! time (TAT): the instant the bucket would be empty if nothing else arrived.
//! A missing key means the bucket is already empty (TAT = now).
//!
//! With `emission_interval = period / rate` and
//! `tolerance = emission_interval * burst`, a request for `n` events computes
//! `new_tat = max(tat, now) + n * emission_interval` and is admitted iff
//! `new_tat - tolerance <= now`. Rejections never move the TAT.

use std::time::Duration;

use tracing::{trace, warn};

use super::codec::{self, NOT_APPLICABLE};
use super::limit::{Decision, Limit};
use crate::error::Result;
use crate::store::clock::CLOCK_RESOLUTION_SECS;
use crate::store::{Arg, AtomicStore, Procedure, Reply, StoreResult};

/// Arguments of the GCRA procedure, in store seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct GcraParams {
    pub burst: f64,
    pub rate: f64,
    pub period: f64,
    pub cost: f64,
}

impl GcraParams {
    fn new(limit: &Limit, n: u64) -> Self {
        Self {
            burst: limit.burst as f64,
            rate: limit.rate as f64,
            period: limit.period.as_secs_f64(),
            cost: n as f64,
        }
    }

    fn to_args(self) -> Vec<Arg> {
        vec![
            Arg::Int(self.burst as u64),
            Arg::Int(self.rate as u64),
            Arg::Float(self.period),
            Arg::Int(self.cost as u64),
        ]
    }

    pub(crate) fn from_args(args: &[Arg]) -> StoreResult<Self> {
        Ok(Self {
            burst: codec::arg(args, 0, "burst")?,
            rate: codec::arg(args, 1, "rate")?,
            period: codec::arg(args, 2, "period")?,
            cost: codec::arg(args, 3, "n")?,
        })
    }
}

/// What one evaluation decided and which TAT, if any, must be stored.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GcraOutcome {
    pub limited: bool,
    pub remaining: u64,
    /// Seconds, [`NOT_APPLICABLE`] when admitted
    pub retry_after: f64,
    /// Seconds, [`NOT_APPLICABLE`] when the bucket stays empty
    pub reset_after: f64,
    /// TAT to persist; `None` leaves the stored state untouched
    pub new_tat: Option<f64>,
}

impl GcraOutcome {
    pub(crate) fn to_replies(&self) -> Vec<Reply> {
        vec![
            Reply::Int(i64::from(self.limited)),
            Reply::Int(i64::try_from(self.remaining).unwrap_or(i64::MAX)),
            Reply::float(self.retry_after),
            Reply::float(self.reset_after),
        ]
    }
}

/// Evaluate one check against the stored TAT.
///
/// This is the arithmetic the store runs atomically; stores without a
/// scripting engine call it directly while holding the key.
pub(crate) fn evaluate(stored_tat: Option<f64>, now: f64, params: &GcraParams) -> GcraOutcome {
    if params.rate == 0.0 {
        return GcraOutcome {
            limited: true,
            remaining: 0,
            retry_after: NOT_APPLICABLE,
            reset_after: NOT_APPLICABLE,
            new_tat: None,
        };
    }

    let emission_interval = params.period / params.rate;
    let tolerance = emission_interval * params.burst;

    let tat = stored_tat.map_or(now, |tat| tat.max(now));
    let new_tat = tat + params.cost * emission_interval;
    let allow_at = new_tat - tolerance;

    let reset_after = if new_tat - now > 0.0 {
        new_tat - now
    } else {
        NOT_APPLICABLE
    };

    // differences below the clock resolution are rounding, not time
    if allow_at - now > CLOCK_RESOLUTION_SECS {
        return GcraOutcome {
            limited: true,
            remaining: whole_events(tolerance - (tat - now), emission_interval),
            retry_after: allow_at - now,
            reset_after,
            new_tat: None,
        };
    }

    GcraOutcome {
        limited: false,
        remaining: whole_events(tolerance - (new_tat - now), emission_interval),
        retry_after: NOT_APPLICABLE,
        reset_after,
        new_tat: (new_tat > now).then_some(new_tat),
    }
}

fn whole_events(headroom: f64, emission_interval: f64) -> u64 {
    let events = ((headroom + CLOCK_RESOLUTION_SECS) / emission_interval).floor();
    if events <= 0.0 {
        0
    } else {
        events as u64
    }
}

/// Decode `[limited, remaining, retry_after, reset_after]`.
fn decode_reply(replies: &[Reply]) -> Result<(bool, u64, Option<Duration>, Option<Duration>)> {
    codec::expect_len(replies, 4)?;
    Ok((
        codec::flag_field(replies, 0, "limited")?,
        codec::count_field(replies, 1, "remaining")?,
        codec::duration_field(replies, 2, "retry_after")?,
        codec::duration_field(replies, 3, "reset_after")?,
    ))
}

/// GCRA engine bound to one namespaced key.
pub struct Gcra<'a, S: ?Sized> {
    store: &'a S,
    key: String,
    limit: &'a Limit,
}

impl<'a, S: AtomicStore + ?Sized> Gcra<'a, S> {
    pub fn new(store: &'a S, key: impl Into<String>, limit: &'a Limit) -> Self {
        Self {
            store,
            key: key.into(),
            limit,
        }
    }

    /// Shorthand for `allow_n(1)`.
    pub async fn allow(&self) -> Result<Decision> {
        self.allow_n(1).await
    }

    /// Report whether `n` events may happen now, consuming quota if so.
    pub async fn allow_n(&self, n: u64) -> Result<Decision> {
        if self.limit.rate == 0 {
            trace!(key = %self.key, "Zero rate, rejecting without store access");
            return Ok(Decision {
                limit: *self.limit,
                key: self.key.clone(),
                allowed: false,
                remaining: 0,
                retry_after: None,
                reset_after: None,
            });
        }

        let args = GcraParams::new(self.limit, n).to_args();
        let replies = self.store.run(Procedure::Gcra, &self.key, &args).await?;

        let (limited, remaining, retry_after, reset_after) =
            decode_reply(&replies).map_err(|e| {
                warn!(key = %self.key, error = %e, "Malformed procedure result");
                e
            })?;

        Ok(Decision {
            limit: *self.limit,
            key: self.key.clone(),
            allowed: !limited,
            remaining,
            retry_after: if limited { retry_after } else { None },
            reset_after,
        })
    }

    /// Forget the key's TAT, returning the bucket to empty.
    pub async fn reset(&self) -> Result<()> {
        self.store.delete(&self.key).await?;
        Ok(())
    }
}
