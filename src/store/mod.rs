//! The shared store boundary.
//!
//! Every admission check is one call to [`AtomicStore::run`], which must
//! execute the named procedure (read state, compute, conditionally write) as
//! a single indivisible unit per key. The algorithms are only sound if the
//! store honours that contract.

pub mod clock;
mod memory;
mod redis;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Unix time of the store epoch, 2017-01-01T00:00:00Z.
///
/// Store-side timestamps are seconds since this instant plus a microsecond
/// fraction, combined into one `f64`.
pub const STORE_EPOCH_UNIX_SECS: u64 = 1_483_228_800;

/// Last unix second (2048-09-09T01:46:39Z) at which an epoch-adjusted
/// microsecond timestamp still fits in an `f64` without losing precision.
pub const PRECISION_HORIZON_UNIX_SECS: u64 = 2_483_228_799;

/// Errors raised by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("key {key} holds state of a different kind")]
    WrongType { key: String },

    #[error("invalid procedure arguments: {0}")]
    InvalidArguments(String),

    #[error("store clock at unix second {0} is past the precision horizon")]
    ClockHorizon(u64),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The atomic procedures a store must be able to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    /// Args `[burst, rate, periodSeconds, n]`,
    /// reply `[limited, remaining, retryAfter, resetAfter]`.
    Gcra,
    /// Args `[rate, periodSeconds]`, reply `[allowed, remaining, retryAfter]`.
    SlidingWindow,
}

impl Procedure {
    /// Server-side script source for stores that run Lua.
    pub fn lua_source(&self) -> &'static str {
        match self {
            Procedure::Gcra => include_str!("scripts/gcra.lua"),
            Procedure::SlidingWindow => include_str!("scripts/sliding_window.lua"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Procedure::Gcra => "gcra",
            Procedure::SlidingWindow => "sliding_window",
        }
    }
}

/// An opaque procedure argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Int(u64),
    Float(f64),
}

impl Arg {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Arg::Int(v) => v as f64,
            Arg::Float(v) => v,
        }
    }
}

/// One element of a procedure's result tuple.
///
/// Mirrors what a scripted store hands back: integers stay integers, floats
/// travel as text.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Int(i64),
    Text(String),
    Nil,
    /// Any reply shape the procedures never produce.
    Other(String),
}

impl Reply {
    /// Render a float the way it travels in a result tuple.
    pub fn float(value: f64) -> Self {
        Reply::Text(value.to_string())
    }
}

/// Capability required from the shared store.
///
/// Implementations must serialize concurrent [`run`](AtomicStore::run) calls
/// on the same key: no two procedures may interleave their read and write.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Run `procedure` atomically against `key`.
    async fn run(&self, procedure: Procedure, key: &str, args: &[Arg]) -> StoreResult<Vec<Reply>>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

#[async_trait]
impl<S: AtomicStore + ?Sized> AtomicStore for std::sync::Arc<S> {
    async fn run(&self, procedure: Procedure, key: &str, args: &[Arg]) -> StoreResult<Vec<Reply>> {
        (**self).run(procedure, key, args).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key).await
    }
}
