//! Tollgate - Distributed Rate Limiting
//!
//! This crate answers "may this event happen now?" for a named key under a
//! rate policy, using either GCRA or an exact sliding window. All state lives
//! in a shared store that runs each check as one atomic procedure, so every
//! process sharing the store sees the same decisions.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{LimiterError, Result};
pub use ratelimit::{Algorithm, Decision, Limit, Limiter};
