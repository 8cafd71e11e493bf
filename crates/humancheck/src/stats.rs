//! Pool-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic process-wide counters. Reset only on process restart.
#[derive(Debug, Default)]
pub struct PoolStats {
    requests_total: AtomicU64,
    solved_ok: AtomicU64,
    solved_fail: AtomicU64,
    reported_invalid: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_solved(&self, ok: bool) {
        if ok {
            self.solved_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.solved_fail.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_invalid(&self) {
        self.reported_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            solved_ok: self.solved_ok.load(Ordering::Relaxed),
            solved_fail: self.solved_fail.load(Ordering::Relaxed),
            reported_invalid: self.reported_invalid.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub solved_ok: u64,
    pub solved_fail: u64,
    pub reported_invalid: u64,
}

/// Per-slot counters, listed by `SessionPool::slot_stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub slot_id: usize,
    pub solve_count: u64,
    pub error_count: u64,
    pub has_fingerprint: bool,
}
