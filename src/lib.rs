//! SSH remote-execution transport with connection reuse and interactive
//! host-key trust.
//!
//! Connections are cached process-wide by `(host, user)` so repeated tasks
//! against the same target reuse one authenticated session. Unknown server
//! keys go through a pluggable trust policy (interactive confirmation by
//! default, serialized across processes with file locks), and keys accepted
//! during a run are merged back into the trust file atomically on close.

pub mod config;
pub mod error;
pub mod lockfile;
pub mod ssh;
pub mod trust;

pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use ssh::{ConnectParams, Connection, ConnectionCache, ConnectionIdentity, SessionHandle};
pub use trust::{TrustContext, TrustDecision, TrustPolicy};
