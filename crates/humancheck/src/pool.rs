//! SessionPool: the pool/lifecycle façade.
//!
//! Owns the slots, the global concurrency gate, the round-robin cursor and
//! the aggregate counters. Each acquisition is admitted by the gate, routed
//! to one slot, run through the slot's retry protocol, and — on success —
//! handed to the release tracker so teardown waits for the token's consumer.
//!
//! Constructed once at process start and passed by reference; there is no
//! global instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, Semaphore};

use crate::config::PoolConfig;
use crate::driver::{SessionDriver, SolveRequest};
use crate::fingerprint::Fingerprint;
use crate::release::ReleaseTracker;
use crate::slot::Slot;
use crate::stats::{PoolStats, SlotSnapshot, StatsSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("session driver is not usable")]
    Unavailable,
}

/// Outcome of one acquisition. `token` is `None` when every attempt failed;
/// `slot_id` always identifies the slot that ran, so the caller can report
/// back against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub token: Option<String>,
    pub slot_id: usize,
}

pub struct SessionPool {
    driver: Arc<dyn SessionDriver>,
    config: RwLock<PoolConfig>,
    /// Slots are created lazily on first assignment and persist until a
    /// shrink evicts them.
    slots: DashMap<usize, Arc<Slot>>,
    /// Concurrency gate sized to the pool. Replaced wholesale on reload so
    /// in-flight acquisitions keep permits of the gate they entered through.
    gate: RwLock<Arc<Semaphore>>,
    cursor: AtomicUsize,
    stats: PoolStats,
    tracker: ReleaseTracker,
}

impl SessionPool {
    pub fn new(driver: Arc<dyn SessionDriver>, config: PoolConfig) -> Arc<Self> {
        let config = config.validated();
        tracing::info!(pool_size = config.pool_size, "session pool configured");
        Arc::new(Self {
            gate: RwLock::new(Arc::new(Semaphore::new(config.pool_size))),
            tracker: ReleaseTracker::new(Arc::clone(&driver)),
            driver,
            config: RwLock::new(config),
            slots: DashMap::new(),
            cursor: AtomicUsize::new(0),
            stats: PoolStats::default(),
        })
    }

    /// Acquire one token.
    ///
    /// Blocks on the concurrency gate, routes to the next slot round-robin,
    /// and runs the slot's retry protocol. A successful solve leaves the
    /// session alive under the release tracker; the caller is expected to
    /// call `notify_finished` once the token has been consumed.
    pub async fn acquire(&self, request: &SolveRequest) -> Result<Acquisition, PoolError> {
        self.stats.record_request();

        if !self.driver.is_usable() {
            tracing::error!("session driver unusable, refusing acquisition");
            return Err(PoolError::Unavailable);
        }

        let gate = Arc::clone(&*self.gate.read().await);
        let _permit = gate
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Unavailable)?;

        let config = self.config.read().await.clone();
        let slot_id = self.cursor.fetch_add(1, Ordering::Relaxed) % config.pool_size;
        let slot = Arc::clone(
            &self
                .slots
                .entry(slot_id)
                .or_insert_with(|| Arc::new(Slot::new(slot_id))),
        );

        let outcome = slot.acquire(&self.driver, &config, request).await;

        match outcome {
            Some((token, session)) => {
                self.stats.record_solved(true);
                self.tracker.schedule(
                    slot_id,
                    session,
                    request.action,
                    config.release_bound(request.action),
                );
                Ok(Acquisition {
                    token: Some(token),
                    slot_id,
                })
            }
            None => {
                self.stats.record_solved(false);
                Ok(Acquisition {
                    token: None,
                    slot_id,
                })
            }
        }
    }

    /// The consumer of the most recent token from `slot_id` is done; tear the
    /// session down now instead of waiting for the timeout fallback.
    /// Idempotent when nothing is pending.
    pub fn notify_finished(&self, slot_id: usize) -> bool {
        self.tracker.release(slot_id)
    }

    /// A previously returned token failed downstream validation. Accounting
    /// only: nothing is closed or recycled here, since every acquisition
    /// already gets a brand-new session.
    pub fn report_invalid(&self, slot_id: usize) {
        self.stats.record_invalid();
        tracing::info!(slot = slot_id, "token reported invalid downstream");
    }

    /// Last captured fingerprint for a slot, or `None` if it was never used.
    pub fn fingerprint_of(&self, slot_id: usize) -> Option<Fingerprint> {
        self.slots.get(&slot_id).and_then(|slot| slot.fingerprint())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-slot counters, ordered by slot id.
    pub fn slot_stats(&self) -> Vec<SlotSnapshot> {
        let mut snapshots: Vec<_> = self.slots.iter().map(|slot| slot.snapshot()).collect();
        snapshots.sort_by_key(|snapshot| snapshot.slot_id);
        snapshots
    }

    /// Apply a new configuration without disrupting in-flight acquisitions.
    ///
    /// The gate is replaced, so the new bound applies to new callers only.
    /// Shrinking evicts slots whose id falls outside the new size, but never
    /// one that is mid-acquisition or still has a session awaiting release;
    /// those are picked up by a later reload.
    pub async fn reload(&self, config: PoolConfig) {
        let config = config.validated();
        let new_size = config.pool_size;

        let old_size = {
            let mut current = self.config.write().await;
            let old_size = current.pool_size;
            *current = config;
            old_size
        };

        if new_size != old_size {
            *self.gate.write().await = Arc::new(Semaphore::new(new_size));
            tracing::info!(old_size, new_size, "pool resized");
        }

        if new_size < old_size {
            let evict: Vec<usize> = self
                .slots
                .iter()
                .filter(|slot| slot.id() >= new_size)
                .filter(|slot| slot.is_idle() && self.tracker.pending_count(slot.id()) == 0)
                .map(|slot| slot.id())
                .collect();
            for slot_id in evict {
                self.slots.remove(&slot_id);
                tracing::info!(slot = slot_id, "slot evicted after shrink");
            }
        }
    }

    /// Graceful termination: stop admitting acquisitions, fire every pending
    /// release immediately, and wait (bounded by `grace`) for the waiters to
    /// finish closing their sessions.
    pub async fn shutdown(&self, grace: Duration) {
        self.gate.read().await.close();
        self.tracker.force_release_all(grace).await;
        tracing::info!("session pool shut down");
    }
}
