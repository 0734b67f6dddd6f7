//! Decoding of atomic procedure arguments and result tuples.

use std::time::Duration;

use crate::error::{LimiterError, Result};
use crate::store::clock::CLOCK_RESOLUTION_SECS;
use crate::store::{Arg, Reply, StoreError, StoreResult};

/// Wire value meaning "not applicable" for a duration field.
pub(crate) const NOT_APPLICABLE: f64 = -1.0;

/// Check a result tuple has exactly `len` elements.
pub(crate) fn expect_len(replies: &[Reply], len: usize) -> Result<()> {
    if replies.len() != len {
        return Err(LimiterError::Decode(format!(
            "expected {} fields, got {}",
            len,
            replies.len()
        )));
    }
    Ok(())
}

pub(crate) fn int_field(replies: &[Reply], index: usize, name: &str) -> Result<i64> {
    match replies.get(index) {
        Some(Reply::Int(value)) => Ok(*value),
        other => Err(LimiterError::Decode(format!(
            "{} must be an integer, got {:?}",
            name, other
        ))),
    }
}

pub(crate) fn flag_field(replies: &[Reply], index: usize, name: &str) -> Result<bool> {
    match int_field(replies, index, name)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(LimiterError::Decode(format!(
            "{} must be 0 or 1, got {}",
            name, other
        ))),
    }
}

pub(crate) fn count_field(replies: &[Reply], index: usize, name: &str) -> Result<u64> {
    let value = int_field(replies, index, name)?;
    u64::try_from(value)
        .map_err(|_| LimiterError::Decode(format!("{} must not be negative, got {}", name, value)))
}

/// A duration carried as text seconds, `-1` meaning "not applicable".
pub(crate) fn duration_field(replies: &[Reply], index: usize, name: &str) -> Result<Option<Duration>> {
    let text = match replies.get(index) {
        Some(Reply::Text(text)) => text,
        other => {
            return Err(LimiterError::Decode(format!(
                "{} must be a numeric string, got {:?}",
                name, other
            )))
        }
    };
    let seconds: f64 = text
        .trim()
        .parse()
        .map_err(|_| LimiterError::Decode(format!("{} is not a number: {:?}", name, text)))?;
    if !seconds.is_finite() {
        return Err(LimiterError::Decode(format!("{} is not finite: {}", name, seconds)));
    }
    if seconds == NOT_APPLICABLE {
        return Ok(None);
    }
    if seconds <= -CLOCK_RESOLUTION_SECS {
        return Err(LimiterError::Decode(format!("{} is negative: {}", name, seconds)));
    }
    // rounding in the store can leave a hair below zero
    Duration::try_from_secs_f64(seconds.max(0.0))
        .map(Some)
        .map_err(|_| LimiterError::Decode(format!("{} is out of range: {}", name, seconds)))
}

/// Read argument `index` of a procedure call as a float.
pub(crate) fn arg(args: &[Arg], index: usize, name: &str) -> StoreResult<f64> {
    let value = args
        .get(index)
        .map(Arg::as_f64)
        .ok_or_else(|| StoreError::InvalidArguments(format!("missing {}", name)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(StoreError::InvalidArguments(format!(
            "{} must be a finite non-negative number, got {}",
            name, value
        )));
    }
    Ok(value)
}
