//! Scriptable driver mock shared by the module tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{ActionKind, PoolConfig};
use crate::driver::{DriverError, NetworkIdentity, Session, SessionDriver, SolveRequest};
use crate::fingerprint::Fingerprint;

/// Route crate logs into the test harness when `RUST_LOG` is set.
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pool config with millisecond-scale deadlines for tests.
pub(crate) fn test_config() -> PoolConfig {
    let mut action_timeouts = HashMap::new();
    action_timeouts.insert(ActionKind::ImageGeneration, Duration::from_millis(200));
    action_timeouts.insert(ActionKind::VideoGeneration, Duration::from_millis(400));

    PoolConfig {
        pool_size: 2,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(5),
        launch_timeout: Duration::from_millis(250),
        action_timeouts,
        release_margin: Duration::from_millis(50),
        proxy: None,
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SolveOutcome {
    Token(String),
    NoToken,
    Error,
}

struct MockInner {
    usable: AtomicBool,
    launch_failures_remaining: AtomicUsize,
    open_delay: StdMutex<Duration>,
    close_delay: StdMutex<Duration>,
    solve_delay: StdMutex<Duration>,
    script: StdMutex<VecDeque<SolveOutcome>>,
    default_outcome: StdMutex<SolveOutcome>,
    fingerprint: StdMutex<Option<Fingerprint>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    double_closes: AtomicUsize,
    live: StdMutex<HashSet<Uuid>>,
    in_flight_solves: AtomicUsize,
    max_concurrent_solves: AtomicUsize,
}

/// Cheap cloneable handle over shared mock state, so tests keep inspecting
/// the driver after handing an `Arc<dyn SessionDriver>` to the pool.
#[derive(Clone)]
pub(crate) struct MockDriver {
    inner: Arc<MockInner>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                usable: AtomicBool::new(true),
                launch_failures_remaining: AtomicUsize::new(0),
                open_delay: StdMutex::new(Duration::ZERO),
                close_delay: StdMutex::new(Duration::ZERO),
                solve_delay: StdMutex::new(Duration::ZERO),
                script: StdMutex::new(VecDeque::new()),
                default_outcome: StdMutex::new(SolveOutcome::Token("token-1".to_string())),
                fingerprint: StdMutex::new(None),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                double_closes: AtomicUsize::new(0),
                live: StdMutex::new(HashSet::new()),
                in_flight_solves: AtomicUsize::new(0),
                max_concurrent_solves: AtomicUsize::new(0),
            }),
        }
    }

    pub fn unusable() -> Self {
        let driver = Self::new();
        driver.inner.usable.store(false, Ordering::SeqCst);
        driver
    }

    pub fn with_default_outcome(self, outcome: SolveOutcome) -> Self {
        *lock(&self.inner.default_outcome) = outcome;
        self
    }

    /// Per-solve outcomes consumed in order; after the script is exhausted
    /// the default outcome applies.
    pub fn with_script(self, outcomes: Vec<SolveOutcome>) -> Self {
        *lock(&self.inner.script) = outcomes.into();
        self
    }

    pub fn with_launch_failures(self, count: usize) -> Self {
        self.inner
            .launch_failures_remaining
            .store(count, Ordering::SeqCst);
        self
    }

    pub fn with_solve_delay(self, delay: Duration) -> Self {
        *lock(&self.inner.solve_delay) = delay;
        self
    }

    /// Launches take this long; an open whose deadline is shorter reaps its
    /// own partial browser and reports a timeout.
    pub fn with_open_delay(self, delay: Duration) -> Self {
        *lock(&self.inner.open_delay) = delay;
        self
    }

    pub fn with_close_delay(self, delay: Duration) -> Self {
        *lock(&self.inner.close_delay) = delay;
        self
    }

    pub fn with_fingerprint(self, fingerprint: Fingerprint) -> Self {
        *lock(&self.inner.fingerprint) = Some(fingerprint);
        self
    }

    pub fn as_session_driver(&self) -> Arc<dyn SessionDriver> {
        Arc::new(self.clone())
    }

    /// A session pre-registered as live, as if this driver had opened it.
    pub fn live_session(&self) -> Session {
        let session = Session::new();
        lock(&self.inner.live).insert(session.id());
        session
    }

    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn double_close_count(&self) -> usize {
        self.inner.double_closes.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner.live).len()
    }

    pub fn max_concurrent_solves(&self) -> usize {
        self.inner.max_concurrent_solves.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight gauge even when a timeout cancels the solve
/// future mid-sleep.
struct SolveGauge {
    inner: Arc<MockInner>,
}

impl SolveGauge {
    fn enter(inner: &Arc<MockInner>) -> Self {
        let now = inner.in_flight_solves.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_concurrent_solves.fetch_max(now, Ordering::SeqCst);
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for SolveGauge {
    fn drop(&mut self) {
        self.inner.in_flight_solves.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionDriver for MockDriver {
    fn is_usable(&self) -> bool {
        self.inner.usable.load(Ordering::SeqCst)
    }

    async fn open(
        &self,
        _identity: NetworkIdentity,
        deadline: Duration,
    ) -> Result<Session, DriverError> {
        let remaining = self.inner.launch_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .inner
                .launch_failures_remaining
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(DriverError::Launch("scripted launch failure".to_string()));
        }

        let delay = *lock(&self.inner.open_delay);
        if delay > deadline {
            // A browser process was partially created before the deadline
            // hit; the driver reaps it itself before reporting the timeout.
            let partial = Uuid::new_v4();
            lock(&self.inner.live).insert(partial);
            tokio::time::sleep(deadline).await;
            lock(&self.inner.live).remove(&partial);
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
            return Err(DriverError::Timeout);
        }
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        let session = Session::new();
        lock(&self.inner.live).insert(session.id());
        Ok(session)
    }

    async fn solve(
        &self,
        _session: &Session,
        _request: &SolveRequest,
        _deadline: Duration,
    ) -> Result<Option<String>, DriverError> {
        let _gauge = SolveGauge::enter(&self.inner);

        let delay = *lock(&self.inner.solve_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let outcome = lock(&self.inner.script)
            .pop_front()
            .unwrap_or_else(|| lock(&self.inner.default_outcome).clone());
        match outcome {
            SolveOutcome::Token(token) => Ok(Some(token)),
            SolveOutcome::NoToken => Ok(None),
            SolveOutcome::Error => Err(DriverError::Solve("scripted solve failure".to_string())),
        }
    }

    async fn capture_fingerprint(&self, _session: &Session) -> Option<Fingerprint> {
        lock(&self.inner.fingerprint).clone()
    }

    async fn close(&self, session: Session) {
        let delay = *lock(&self.inner.close_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.inner.live).remove(&session.id()) {
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.inner.double_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
