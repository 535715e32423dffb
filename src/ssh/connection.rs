//! Per-task connection handle: handshake, trust verification, command
//! dispatch, and teardown.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use russh::client::{self, Handle, Handler, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{load_secret_key, PublicKey, PublicKeyBase64};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::ssh::cache::{ConnectionCache, ConnectionIdentity};
use crate::trust::{lookup_name, TrustContext};

/// Marker substrings that identify a protocol-version mismatch with the
/// remote server in an underlying handshake error.
const VERSION_MISMATCH_MARKERS: &[&str] =
    &["protocol version", "version exchange", "incompatible ssh"];

/// Marker substrings that identify an encrypted private key rejected for
/// want of a passphrase.
const ENCRYPTED_KEY_MARKERS: &[&str] = &[
    "private key file is encrypted",
    "encrypted private key",
    "passphrase required",
];

fn contains_marker(reason: &str, markers: &[&str]) -> bool {
    let lower = reason.to_ascii_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

/// Classify a handshake failure into an actionable error kind.
///
/// Version mismatches get an upgrade hint, encrypted-key failures get an
/// explicit-user hint, and everything else surfaces as a generic connection
/// failure carrying the underlying message. None are retried here.
fn classify_handshake_error(user: &str, host: &str, port: u16, reason: &str) -> TransportError {
    if contains_marker(reason, VERSION_MISMATCH_MARKERS) {
        TransportError::ProtocolMismatch {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    } else if contains_marker(reason, ENCRYPTED_KEY_MARKERS) {
        TransportError::EncryptedKey {
            user: user.to_string(),
            host: host.to_string(),
            port,
            reason: reason.to_string(),
        }
    } else {
        TransportError::Connection {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Per-connection parameters handed in by the orchestrating runtime.
/// Credentials arrive already resolved; this layer never probes for them.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    /// 0 means the default SSH port.
    pub port: u16,
    pub user: String,
    pub password: Option<Zeroizing<String>>,
    /// Per-connection override; beats the configured per-run default.
    pub private_key_file: Option<String>,
}

impl ConnectParams {
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            22
        } else {
            self.port
        }
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key_file", &self.private_key_file)
            .finish()
    }
}

/// Connection lifecycle. `Failed` and `Closed` are terminal: a new attempt
/// needs a new [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
    Failed,
}

/// Shared handle over one authenticated session. At most one per
/// [`ConnectionIdentity`] lives in the cache at a time.
pub type SessionHandle = Arc<Handle<TrustHandler>>;

/// russh client handler that routes server-key checks through the
/// [`TrustContext`].
///
/// russh only lets `check_server_key` answer yes or no, so the precise
/// verification error (rejection, mismatch) is parked in a shared slot and
/// recovered by the handshake when the connect call fails.
pub struct TrustHandler {
    host_label: String,
    trust: Arc<TrustContext>,
    verify_error: Arc<Mutex<Option<TransportError>>>,
}

impl Handler for TrustHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let trust = self.trust.clone();
        let host_label = self.host_label.clone();
        let key_type = server_public_key.algorithm().to_string();
        let key_bytes = server_public_key.public_key_bytes();

        // The trust policy may block on a human and on cross-process locks;
        // keep that off the async reactor.
        let verdict = match tokio::task::spawn_blocking(move || {
            trust.verify(&host_label, &key_type, &key_bytes)
        })
        .await
        {
            Ok(verdict) => verdict,
            Err(e) => Err(TransportError::Connection {
                host: self.host_label.clone(),
                reason: format!("host key verification task failed: {e}"),
            }),
        };

        match verdict {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(host = %self.host_label, error = %e, "host key verification failed");
                *self.verify_error.lock() = Some(e);
                Ok(false)
            }
        }
    }
}

/// The per-task transport handle: owns at most one underlying session from
/// the process-wide cache and exposes connect/execute/close.
pub struct Connection {
    params: ConnectParams,
    identity: ConnectionIdentity,
    config: Arc<TransportConfig>,
    cache: Arc<ConnectionCache<SessionHandle>>,
    trust: Arc<TrustContext>,
    state: ConnectionState,
    session: Option<SessionHandle>,
}

impl Connection {
    #[must_use]
    pub fn new(
        params: ConnectParams,
        config: Arc<TransportConfig>,
        cache: Arc<ConnectionCache<SessionHandle>>,
        trust: Arc<TrustContext>,
    ) -> Self {
        let identity = ConnectionIdentity::new(params.host.clone(), params.user.clone());
        Self {
            params,
            identity,
            config,
            cache,
            trust,
            state: ConnectionState::Unconnected,
            session: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Establish (or reuse) the session for this connection's identity.
    ///
    /// Idempotent through the cache: if a live session already exists for
    /// `(host, user)`, it is returned without a handshake. A failed handshake
    /// moves the connection to the terminal `Failed` state; retrying means
    /// building a new `Connection`.
    ///
    /// # Errors
    ///
    /// Returns a classified handshake error, a trust error from key
    /// verification, or an authentication error. Never retried internally.
    pub async fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Failed => {
                return Err(TransportError::Connection {
                    host: self.params.host.clone(),
                    reason: "previous connection attempt failed; build a new connection"
                        .to_string(),
                });
            }
            ConnectionState::Closed => {
                return Err(TransportError::Connection {
                    host: self.params.host.clone(),
                    reason: "connection is closed".to_string(),
                });
            }
            ConnectionState::Unconnected | ConnectionState::Connecting => {}
        }

        self.state = ConnectionState::Connecting;
        let params = self.params.clone();
        let config = self.config.clone();
        let trust = self.trust.clone();

        let result = self
            .cache
            .get_or_create(&self.identity, || Self::handshake(params, config, trust))
            .await;

        match result {
            Ok(session) => {
                self.session = Some(session);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    /// Full handshake for a cache miss: TCP + SSH transport with the trust
    /// handler, then authentication with explicit credentials only (no
    /// agent, no key discovery).
    async fn handshake(
        params: ConnectParams,
        config: Arc<TransportConfig>,
        trust: Arc<TrustContext>,
    ) -> Result<SessionHandle> {
        let port = params.effective_port();
        debug!(
            user = %params.user,
            port = port,
            host = %params.host,
            "establishing connection"
        );

        let verify_error = Arc::new(Mutex::new(None));
        let handler = TrustHandler {
            host_label: lookup_name(&params.host, port),
            trust,
            verify_error: verify_error.clone(),
        };

        let ssh_config = Arc::new(client::Config::default());
        let addr = format!("{}:{}", params.host, port);
        let connect_timeout = config.connect_timeout();

        // The timeout bounds only the TCP phase. Key verification during the
        // SSH transport phase may block on a human at the confirmation
        // prompt, while holding the cross-process prompt locks; a deadline
        // there would abandon the prompt thread with the locks still held
        // and leave its eventual answer to be misread by the next prompt.
        let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(classify_handshake_error(
                    &params.user,
                    &params.host,
                    port,
                    &e.to_string(),
                ));
            }
            Err(_) => {
                return Err(TransportError::Connection {
                    host: params.host.clone(),
                    reason: format!(
                        "connection timeout after {}s",
                        config.connect_timeout_seconds
                    ),
                });
            }
        };

        let mut handle = match client::connect_stream(ssh_config, stream, handler).await {
            Ok(handle) => handle,
            Err(e) => {
                // A trust failure shows up here as a refused server key;
                // surface the precise error instead of the generic one.
                if let Some(trust_err) = verify_error.lock().take() {
                    return Err(trust_err);
                }
                return Err(classify_handshake_error(
                    &params.user,
                    &params.host,
                    port,
                    &e.to_string(),
                ));
            }
        };

        // Explicit per-connection key beats the per-run default.
        let key_path = params
            .private_key_file
            .clone()
            .or_else(|| config.private_key_file.clone());

        let authenticated = if let Some(path) = key_path {
            let expanded = shellexpand::tilde(&path);
            let key = load_secret_key(expanded.as_ref(), None).map_err(|e| {
                let reason = e.to_string();
                if contains_marker(&reason, ENCRYPTED_KEY_MARKERS) {
                    TransportError::EncryptedKey {
                        user: params.user.clone(),
                        host: params.host.clone(),
                        port,
                        reason,
                    }
                } else {
                    TransportError::KeyInvalid { path, reason }
                }
            })?;

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            handle
                .authenticate_publickey(
                    &params.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
                .map_err(|e| {
                    classify_handshake_error(&params.user, &params.host, port, &e.to_string())
                })?
                .success()
        } else if let Some(password) = &params.password {
            handle
                .authenticate_password(&params.user, password.as_str())
                .await
                .map_err(|e| {
                    classify_handshake_error(&params.user, &params.host, port, &e.to_string())
                })?
                .success()
        } else {
            return Err(TransportError::NoAuthMethod {
                user: params.user.clone(),
                host: params.host.clone(),
            });
        };

        if !authenticated {
            return Err(TransportError::Auth {
                user: params.user.clone(),
                host: params.host.clone(),
            });
        }

        info!(user = %params.user, host = %params.host, port = port, "session established");
        Ok(Arc::new(handle))
    }

    /// Open an interactive channel and write `command` (newline-terminated)
    /// to it. Returns the channel without waiting for completion; collecting
    /// output and exit status is the caller's business.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelOpen`] if the session channel or the
    /// shell on it cannot be opened, and a generic connection error if the
    /// command bytes cannot be written. Either way the session is in an
    /// undefined state and should be closed.
    pub async fn execute(&mut self, command: &str) -> Result<russh::Channel<Msg>> {
        let Some(session) = &self.session else {
            return Err(TransportError::Connection {
                host: self.params.host.clone(),
                reason: "execute requires a connected session".to_string(),
            });
        };
        if self.state != ConnectionState::Connected {
            return Err(TransportError::Connection {
                host: self.params.host.clone(),
                reason: "execute requires a connected session".to_string(),
            });
        }

        let mut channel =
            session
                .channel_open_session()
                .await
                .map_err(|e| TransportError::ChannelOpen {
                    reason: e.to_string(),
                })?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| TransportError::ChannelOpen {
                reason: e.to_string(),
            })?;

        let line = format!("{command}\n");
        channel
            .data(line.as_bytes())
            .await
            .map_err(|e| TransportError::Connection {
                host: self.params.host.clone(),
                reason: format!("failed to write command: {e}"),
            })?;

        Ok(channel)
    }

    /// Tear the connection down: evict the identity from the cache, flush
    /// newly trusted keys if checking and recording are both enabled, and
    /// close the underlying transport.
    ///
    /// Always attempts the transport close, even when the flush fails, and
    /// never returns an error.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        self.cache.evict(&self.identity).await;

        if self.trust.should_record() && self.trust.any_session_additions() {
            let trust = self.trust.clone();
            // File locks and the rewrite are blocking; keep them off the
            // reactor. A panicked flush task is swallowed like any other
            // persistence failure.
            if tokio::task::spawn_blocking(move || trust.flush_best_effort())
                .await
                .is_err()
            {
                warn!(identity = %self.identity, "trust store flush task failed");
            }
        }

        if let Some(session) = self.session.take() {
            if let Err(e) = session
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                debug!(identity = %self.identity, error = %e, "disconnect failed during close");
            }
        }

        self.state = ConnectionState::Closed;
    }
}
