//! In-process store implementing the atomic procedure contract.
//!
//! Each procedure runs while holding the key's map entry, so concurrent
//! checks on one key are serialized exactly like scripts on a shared server.
//! State only lives as long as the process; use it for tests and single-node
//! deployments.
//!
//! Expired keys are dropped lazily when touched again. A long-running process
//! seeing many distinct keys should also run [`MemoryStore::spawn_purge`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::clock::{self, Clock, SystemClock};
use super::{Arg, AtomicStore, Procedure, Reply, StoreError, StoreResult};
use crate::ratelimit::gcra::{self, GcraParams};
use crate::ratelimit::sliding_window::{self, WindowParams};

/// Per-key state.
#[derive(Debug, Clone)]
enum Slot {
    Tat(f64),
    Window(Vec<f64>),
}

#[derive(Debug, Clone)]
struct Record {
    slot: Slot,
    /// Store seconds after which the record no longer exists
    expires_at: f64,
}

impl Record {
    fn is_expired(&self, now: f64) -> bool {
        now >= self.expires_at
    }
}

/// A [`AtomicStore`] backed by a concurrent hash map.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, Record>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Number of stored keys, including ones expired but not yet purged.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Remove expired keys, returning how many were dropped.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.now()?;
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.records.len()))
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` on the tokio
    /// runtime. The task ends once the store is dropped.
    pub fn spawn_purge(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, remaining = store.len(), "Purged expired keys"),
                    Err(e) => warn!(error = %e, "Failed to purge expired keys"),
                }
            }
        })
    }

    fn now(&self) -> StoreResult<f64> {
        clock::store_seconds(self.clock.now())
    }

    fn run_gcra(&self, key: &str, args: &[Arg]) -> StoreResult<Vec<Reply>> {
        let params = GcraParams::from_args(args)?;
        let now = self.now()?;

        let outcome = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = match occupied.get() {
                    record if record.is_expired(now) => None,
                    Record { slot: Slot::Tat(tat), .. } => Some(*tat),
                    Record { slot: Slot::Window(_), .. } => {
                        return Err(StoreError::WrongType { key: key.to_string() })
                    }
                };
                let outcome = gcra::evaluate(stored, now, &params);
                match outcome.new_tat {
                    Some(tat) => {
                        occupied.insert(Record {
                            slot: Slot::Tat(tat),
                            expires_at: tat,
                        });
                    }
                    None if stored.is_none() => {
                        occupied.remove();
                    }
                    None => {}
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let outcome = gcra::evaluate(None, now, &params);
                if let Some(tat) = outcome.new_tat {
                    vacant.insert(Record {
                        slot: Slot::Tat(tat),
                        expires_at: tat,
                    });
                }
                outcome
            }
        };

        Ok(outcome.to_replies())
    }

    fn run_sliding_window(&self, key: &str, args: &[Arg]) -> StoreResult<Vec<Reply>> {
        let params = WindowParams::from_args(args)?;
        let now = self.now()?;

        let mut record = match self.records.entry(key.to_string()) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => vacant.insert(Record {
                slot: Slot::Window(Vec::new()),
                expires_at: now,
            }),
        };

        if record.is_expired(now) {
            record.slot = Slot::Window(Vec::new());
        }
        let outcome = match &mut record.slot {
            Slot::Window(stamps) => sliding_window::evaluate(stamps, now, &params),
            Slot::Tat(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };
        if outcome.allowed {
            record.expires_at = now + params.period;
        }

        let empty = matches!(&record.slot, Slot::Window(stamps) if stamps.is_empty());
        drop(record);
        if empty {
            // an empty set is no key at all
            self.records
                .remove_if(key, |_, record| matches!(&record.slot, Slot::Window(stamps) if stamps.is_empty()));
        }

        Ok(outcome.to_replies())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn run(&self, procedure: Procedure, key: &str, args: &[Arg]) -> StoreResult<Vec<Reply>> {
        trace!(key = %key, procedure = procedure.name(), "Running procedure in memory");
        match procedure {
            Procedure::Gcra => self.run_gcra(key, args),
            Procedure::SlidingWindow => self.run_sliding_window(key, args),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.records.remove(key);
        Ok(())
    }
}
