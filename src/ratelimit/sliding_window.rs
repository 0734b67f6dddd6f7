//! Sliding window engine.
//!
//! Each key holds the timestamps of admitted events. A check first evicts
//! everything at or before `now - period`, then admits iff fewer than `rate`
//! timestamps remain. Counting is exact, at the cost of one stored entry per
//! event inside the window.
//!
//! `remaining` is reported as unused capacity: `rate - (count + 1)` after an
//! admission, `rate - count` clamped at zero on rejection.

use std::time::Duration;

use tracing::warn;

use super::codec::{self, NOT_APPLICABLE};
use super::limit::{Decision, Limit};
use crate::error::Result;
use crate::store::{Arg, AtomicStore, Procedure, Reply, StoreResult};

/// Arguments of the sliding window procedure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowParams {
    pub rate: u64,
    /// Window length in seconds
    pub period: f64,
}

impl WindowParams {
    fn new(limit: &Limit) -> Self {
        Self {
            rate: limit.rate,
            period: limit.period.as_secs_f64(),
        }
    }

    fn to_args(self) -> Vec<Arg> {
        vec![Arg::Int(self.rate), Arg::Float(self.period)]
    }

    pub(crate) fn from_args(args: &[Arg]) -> StoreResult<Self> {
        Ok(Self {
            rate: codec::arg(args, 0, "rate")? as u64,
            period: codec::arg(args, 1, "period")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WindowOutcome {
    pub allowed: bool,
    pub remaining: u64,
    /// Seconds, [`NOT_APPLICABLE`] when admitted
    pub retry_after: f64,
}

impl WindowOutcome {
    pub(crate) fn to_replies(&self) -> Vec<Reply> {
        vec![
            Reply::Int(i64::from(self.allowed)),
            Reply::Int(i64::try_from(self.remaining).unwrap_or(i64::MAX)),
            Reply::float(self.retry_after),
        ]
    }
}

/// Evaluate one check, evicting and recording timestamps in place.
///
/// `stamps` must be sorted ascending and stays sorted.
pub(crate) fn evaluate(stamps: &mut Vec<f64>, now: f64, params: &WindowParams) -> WindowOutcome {
    let clear_before = now - params.period;
    stamps.retain(|&stamp| stamp > clear_before);

    let count = stamps.len() as u64;
    if count >= params.rate {
        let oldest = stamps.first().copied().unwrap_or(now);
        return WindowOutcome {
            allowed: false,
            remaining: params.rate.saturating_sub(count),
            retry_after: params.period - (now - oldest),
        };
    }

    let position = stamps.partition_point(|&stamp| stamp <= now);
    stamps.insert(position, now);

    WindowOutcome {
        allowed: true,
        remaining: params.rate - (count + 1),
        retry_after: NOT_APPLICABLE,
    }
}

/// Decode `[allowed, remaining, retry_after]`.
fn decode_reply(replies: &[Reply]) -> Result<(bool, u64, Option<Duration>)> {
    codec::expect_len(replies, 3)?;
    Ok((
        codec::flag_field(replies, 0, "allowed")?,
        codec::count_field(replies, 1, "remaining")?,
        codec::duration_field(replies, 2, "retry_after")?,
    ))
}

/// Sliding window engine bound to one namespaced key.
pub struct SlidingWindow<'a, S: ?Sized> {
    store: &'a S,
    key: String,
    limit: &'a Limit,
}

impl<'a, S: AtomicStore + ?Sized> SlidingWindow<'a, S> {
    pub fn new(store: &'a S, key: impl Into<String>, limit: &'a Limit) -> Self {
        Self {
            store,
            key: key.into(),
            limit,
        }
    }

    /// Report whether one event may happen now, recording it if so.
    pub async fn allow(&self) -> Result<Decision> {
        let args = WindowParams::new(self.limit).to_args();
        let replies = self.store.run(Procedure::SlidingWindow, &self.key, &args).await?;

        let (allowed, remaining, retry_after) = decode_reply(&replies).map_err(|e| {
            warn!(key = %self.key, error = %e, "Malformed procedure result");
            e
        })?;

        Ok(Decision {
            limit: *self.limit,
            key: self.key.clone(),
            allowed,
            remaining,
            retry_after: if allowed { None } else { retry_after },
            reset_after: Some(self.limit.period),
        })
    }

    /// Drop every recorded timestamp for the key.
    pub async fn reset(&self) -> Result<()> {
        self.store.delete(&self.key).await?;
        Ok(())
    }
}
