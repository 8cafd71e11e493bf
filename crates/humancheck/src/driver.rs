//! Session driver seam.
//!
//! The pool never talks to a browser directly. It consumes this narrow
//! interface: open a session, solve the enterprise challenge inside it,
//! capture the fingerprint it presents, close it. How a session maps onto an
//! actual browser process (CDP connection, WebDriver, remote farm) is the
//! driver implementation's business.

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::config::{ActionKind, ProxyConfig};
use crate::fingerprint::Fingerprint;

/// Opaque handle to a running browser context.
///
/// Owned by exactly one holder at a time; `SessionDriver::close` consumes it,
/// so a session cannot be torn down twice from this side of the seam.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
}

impl Session {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of one challenge solve.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    /// Upstream project the token will be spent against.
    pub project_id: String,
    /// Enterprise site key rendered into the challenge page.
    pub site_key: String,
    pub action: ActionKind,
}

impl SolveRequest {
    pub fn new(
        project_id: impl Into<String>,
        site_key: impl Into<String>,
        action: ActionKind,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            site_key: site_key.into(),
            action,
        }
    }
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.8,de;q=0.5",
];

/// Network identity a session is opened with.
///
/// Rotated per attempt: a retry never reuses the identity of a failed
/// attempt, so a stale fingerprint cannot contaminate the next solve.
#[derive(Debug, Clone)]
pub struct NetworkIdentity {
    pub user_agent: String,
    pub accept_language: String,
    pub proxy: Option<ProxyConfig>,
}

impl NetworkIdentity {
    pub fn randomized(proxy: Option<ProxyConfig>) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            user_agent: USER_AGENTS
                .choose(&mut rng)
                .copied()
                .unwrap_or(USER_AGENTS[0])
                .to_string(),
            accept_language: ACCEPT_LANGUAGES
                .choose(&mut rng)
                .copied()
                .unwrap_or(ACCEPT_LANGUAGES[0])
                .to_string(),
            proxy,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("session launch failed: {0}")]
    Launch(String),
    #[error("challenge solve failed: {0}")]
    Solve(String),
    #[error("driver call timed out")]
    Timeout,
}

/// Capability for driving one browser session at a time.
///
/// Implementations must make `close` idempotent in their own bookkeeping and
/// never fail it observably; the pool counts on every exit path reaching a
/// close exactly once.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// False when the driver cannot run at all (missing browser binary,
    /// headless-hostile environment). Checked before any slot is engaged.
    fn is_usable(&self) -> bool {
        true
    }

    /// Open a session within `deadline`.
    ///
    /// The driver enforces the deadline itself and must tear down whatever it
    /// partially created before returning [`DriverError::Timeout`]. The pool
    /// never cancels this future from outside, so cleanup of a half-launched
    /// browser always stays in the driver's hands.
    async fn open(
        &self,
        identity: NetworkIdentity,
        deadline: Duration,
    ) -> Result<Session, DriverError>;

    /// Execute the challenge. `Ok(None)` means the page produced no token;
    /// the caller treats it exactly like an error. `deadline` is forwarded so
    /// the in-page script can bound its own wait.
    async fn solve(
        &self,
        session: &Session,
        request: &SolveRequest,
        deadline: Duration,
    ) -> Result<Option<String>, DriverError>;

    async fn capture_fingerprint(&self, session: &Session) -> Option<Fingerprint>;

    async fn close(&self, session: Session);
}
