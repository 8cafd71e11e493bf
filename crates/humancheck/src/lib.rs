//! humancheck: bounded browser-session pool for proof-of-humanity tokens.
//!
//! The pool drives a fixed number of reusable slots, each solving an
//! enterprise challenge inside a short-lived browser session supplied by a
//! [`SessionDriver`]. A successful solve returns an opaque token immediately;
//! the session itself stays alive under a deferred-release tracker until the
//! token's out-of-band consumer reports completion or a timeout fires, so
//! slots are recycled fast and sessions are never leaked.

mod fingerprint;
mod release;
mod slot;
mod stats;

pub mod config;
pub mod driver;
pub mod pool;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{ActionKind, ConfigError, PoolConfig, ProxyConfig};
pub use driver::{DriverError, NetworkIdentity, Session, SessionDriver, SolveRequest};
pub use fingerprint::Fingerprint;
pub use pool::{Acquisition, PoolError, SessionPool};
pub use stats::{SlotSnapshot, StatsSnapshot};
