//! Slot: one addressable execution unit of the pool.
//!
//! A slot runs at most one acquisition at a time (single-flight) and owns at
//! most one live session while doing so. The retry protocol lives here:
//! `Launching -> Solving` up to a bounded number of attempts, with a fresh
//! randomized network identity and a brand-new session per attempt.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;

use crate::config::PoolConfig;
use crate::driver::{NetworkIdentity, Session, SessionDriver, SolveRequest};
use crate::fingerprint::Fingerprint;
use crate::stats::SlotSnapshot;

#[derive(Debug, Default)]
struct SlotState {
    solve_count: u64,
    error_count: u64,
    fingerprint: Option<Fingerprint>,
}

pub struct Slot {
    id: usize,
    /// Single-flight gate: held for the whole acquire protocol.
    flight: Mutex<()>,
    /// Counters and last fingerprint. Mutated only while `flight` is held;
    /// readers (stats, reload) take just this mutex.
    state: StdMutex<SlotState>,
}

impl Slot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            flight: Mutex::new(()),
            state: StdMutex::new(SlotState::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// True when no acquisition is running on this slot right now.
    pub fn is_idle(&self) -> bool {
        self.flight.try_lock().is_ok()
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.lock_state().fingerprint.clone()
    }

    pub fn counters(&self) -> (u64, u64) {
        let state = self.lock_state();
        (state.solve_count, state.error_count)
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let state = self.lock_state();
        SlotSnapshot {
            slot_id: self.id,
            solve_count: state.solve_count,
            error_count: state.error_count,
            has_fingerprint: state.fingerprint.is_some(),
        }
    }

    /// Run the acquire-with-retry protocol against this slot.
    ///
    /// On success returns the token together with the still-live session; the
    /// caller hands the session to the release tracker, never closes it here.
    /// On exhaustion returns `None` with every attempt's session closed.
    pub async fn acquire(
        &self,
        driver: &Arc<dyn SessionDriver>,
        config: &PoolConfig,
        request: &SolveRequest,
    ) -> Option<(String, Session)> {
        let _flight = self.flight.lock().await;

        for attempt in 1..=config.max_attempts {
            let identity = NetworkIdentity::randomized(config.proxy.clone());

            // The driver owns the launch deadline: cancelling its future here
            // would orphan a half-launched browser.
            let session = match driver.open(identity.clone(), config.launch_timeout).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(slot = self.id, attempt, error = %e, "session launch failed");
                    self.record_error();
                    self.backoff(attempt, config).await;
                    continue;
                }
            };

            // The identity the session was opened with is already part of its
            // fingerprint, ahead of any page capture.
            self.merge_fingerprint(Fingerprint {
                user_agent: identity.user_agent,
                accept_language: Some(identity.accept_language),
                proxy_url: identity.proxy.map(|p| p.url),
                ..Default::default()
            });

            let deadline = config.action_timeout(request.action);
            match tokio::time::timeout(deadline, driver.solve(&session, request, deadline)).await {
                Ok(Ok(Some(token))) => {
                    if let Some(captured) = driver.capture_fingerprint(&session).await {
                        self.merge_fingerprint(captured);
                    }
                    self.record_solve();
                    tracing::info!(
                        slot = self.id,
                        attempt,
                        session = %session.id(),
                        "challenge solved"
                    );
                    return Some((token, session));
                }
                Ok(Ok(None)) => {
                    tracing::warn!(slot = self.id, attempt, "solve produced no token");
                }
                Ok(Err(e)) => {
                    tracing::warn!(slot = self.id, attempt, error = %e, "solve failed");
                }
                Err(_) => {
                    tracing::warn!(slot = self.id, attempt, "solve deadline exceeded");
                }
            }

            driver.close(session).await;
            self.record_error();
            self.backoff(attempt, config).await;
        }

        tracing::warn!(
            slot = self.id,
            attempts = config.max_attempts,
            "acquisition exhausted all attempts"
        );
        None
    }

    async fn backoff(&self, attempt: u32, config: &PoolConfig) {
        if attempt < config.max_attempts {
            tokio::time::sleep(config.retry_backoff).await;
        }
    }

    fn record_solve(&self) {
        self.lock_state().solve_count += 1;
    }

    fn record_error(&self) {
        self.lock_state().error_count += 1;
    }

    fn merge_fingerprint(&self, newer: Fingerprint) {
        let mut state = self.lock_state();
        state
            .fingerprint
            .get_or_insert_with(Fingerprint::default)
            .merge(newer);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            // Counters and a fingerprint snapshot cannot be left inconsistent
            // by a panicking writer; recover the data.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
