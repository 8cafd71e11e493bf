//! Deferred session release.
//!
//! A solved session stays alive until the downstream consumer of its token
//! reports completion, or a generous timeout fires. Either way the session is
//! closed exactly once; a crashed consumer can never hold one open forever.
//! Every waiter runs on a tracked task group so shutdown can drain them
//! deterministically.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::ActionKind;
use crate::driver::{Session, SessionDriver};

type PendingQueue = VecDeque<(Uuid, oneshot::Sender<()>)>;

pub struct ReleaseTracker {
    driver: Arc<dyn SessionDriver>,
    /// Per-slot FIFO of unfired release signals, keyed by session id so a
    /// timed-out waiter can drop its own stale entry.
    pending: Arc<DashMap<usize, PendingQueue>>,
    tasks: TaskTracker,
    /// Abort handles for live waiters, so shutdown can cut one loose when it
    /// is stuck inside the driver past the grace period.
    waiters: StdMutex<Vec<AbortHandle>>,
}

impl ReleaseTracker {
    pub fn new(driver: Arc<dyn SessionDriver>) -> Self {
        Self {
            driver,
            pending: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            waiters: StdMutex::new(Vec::new()),
        }
    }

    /// Keep `session` alive until `release(slot_id)` fires or `wait_bound`
    /// elapses, then close it. Fire-and-forget; the waiter is tracked.
    pub fn schedule(&self, slot_id: usize, session: Session, kind: ActionKind, wait_bound: Duration) {
        let (tx, rx) = oneshot::channel();
        let session_id = session.id();
        self.pending
            .entry(slot_id)
            .or_default()
            .push_back((session_id, tx));

        tracing::debug!(
            slot = slot_id,
            session = %session_id,
            kind = kind.as_str(),
            wait_bound_ms = wait_bound.as_millis() as u64,
            "deferred release scheduled"
        );

        let driver = Arc::clone(&self.driver);
        let pending = Arc::clone(&self.pending);
        let handle = self.tasks.spawn(async move {
            tokio::select! {
                _ = rx => {
                    tracing::info!(
                        slot = slot_id,
                        session = %session_id,
                        "session release completed via notification"
                    );
                }
                _ = tokio::time::sleep(wait_bound) => {
                    // The consumer never reported back; drop our stale signal
                    // so a later notification cannot pop it instead of a
                    // newer pending release.
                    remove_entry(&pending, slot_id, session_id);
                    tracing::warn!(
                        slot = slot_id,
                        session = %session_id,
                        "session release completed via timeout fallback"
                    );
                }
            }
            driver.close(session).await;
        });

        let mut waiters = self.lock_waiters();
        waiters.retain(|h| !h.is_finished());
        waiters.push(handle.abort_handle());
    }

    /// Fire the oldest pending release for a slot. Returns false (no-op) when
    /// nothing is pending.
    pub fn release(&self, slot_id: usize) -> bool {
        let popped = {
            let Some(mut queue) = self.pending.get_mut(&slot_id) else {
                return false;
            };
            queue.pop_front()
        };
        self.drop_if_empty(slot_id);

        match popped {
            Some((session_id, tx)) => {
                if tx.send(()).is_err() {
                    // Waiter raced us on its timeout; it closes the session.
                    tracing::debug!(
                        slot = slot_id,
                        session = %session_id,
                        "release signal arrived after timeout fallback"
                    );
                }
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self, slot_id: usize) -> usize {
        self.pending.get(&slot_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.pending.iter().map(|entry| entry.len()).sum()
    }

    /// Fire every outstanding signal and wait (bounded) for all waiters to
    /// finish closing their sessions. A waiter still stuck inside the driver
    /// after `grace` is aborted rather than awaited, so this always returns.
    pub async fn force_release_all(&self, grace: Duration) {
        let mut fired = 0usize;
        for mut entry in self.pending.iter_mut() {
            while let Some((_, tx)) = entry.pop_front() {
                let _ = tx.send(());
                fired += 1;
            }
        }
        self.pending.clear();

        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            let stuck: Vec<AbortHandle> = self
                .lock_waiters()
                .drain(..)
                .filter(|h| !h.is_finished())
                .collect();
            tracing::error!(
                fired,
                aborted = stuck.len(),
                "release waiters did not drain within grace period, aborting"
            );
            for handle in stuck {
                handle.abort();
            }
            self.tasks.wait().await;
        } else if fired > 0 {
            tracing::info!(fired, "all deferred releases drained");
        }
        self.lock_waiters().clear();
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, Vec<AbortHandle>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            // A panicking holder leaves only a list of handles behind;
            // recover it.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn drop_if_empty(&self, slot_id: usize) {
        self.pending
            .remove_if(&slot_id, |_, queue| queue.is_empty());
    }
}

fn remove_entry(pending: &DashMap<usize, PendingQueue>, slot_id: usize, session_id: Uuid) {
    if let Some(mut queue) = pending.get_mut(&slot_id) {
        queue.retain(|(id, _)| *id != session_id);
    }
    pending.remove_if(&slot_id, |_, queue| queue.is_empty());
}
