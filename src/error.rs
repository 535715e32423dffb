use thiserror::Error;

/// Errors surfaced by the transport.
///
/// Everything that happens before a session is cached is reported to the
/// immediate caller as one of these. Trust-file persistence failures are the
/// one exception: they are logged and swallowed inside `close()` and only the
/// flush path itself ever sees [`TransportError::Persistence`].
#[derive(Error, Debug)]
pub enum TransportError {
    /// The server and client could not agree on an SSH protocol version.
    #[error(
        "SSH protocol mismatch connecting to {host}: {reason}; \
         upgrade the SSH client library on the control machine"
    )]
    ProtocolMismatch { host: String, reason: String },

    /// The private key file is encrypted and no passphrase was supplied.
    #[error(
        "ssh {user}@{host}:{port} : {reason}\n\
         To connect as a different user, pass an explicit user"
    )]
    EncryptedKey {
        user: String,
        host: String,
        port: u16,
        reason: String,
    },

    /// Generic handshake failure carrying the underlying message.
    #[error("SSH connection failed to {host}: {reason}")]
    Connection { host: String, reason: String },

    /// The interactive policy declined an unknown host key. Fatal for this
    /// attempt, never silently downgraded to accept.
    #[error("host key for {host} rejected by user (fingerprint: {fingerprint})")]
    TrustRejected { host: String, fingerprint: String },

    /// The presented key differs from the one in the trust store.
    #[error("host key mismatch for {host}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// The private key file could not be read or parsed.
    #[error("invalid private key {path}: {reason}")]
    KeyInvalid { path: String, reason: String },

    /// The server rejected the supplied credentials.
    #[error("authentication failed for {user}@{host}")]
    Auth { user: String, host: String },

    /// Neither a password nor a private key file was supplied.
    #[error("no authentication method for {user}@{host}: supply a password or a private key file")]
    NoAuthMethod { user: String, host: String },

    /// A session channel could not be opened on an established connection.
    #[error("failed to open session: {reason}")]
    ChannelOpen { reason: String },

    /// Trust-file flush error. Best effort: logged and swallowed by
    /// `flush_best_effort`, never escalated past `close()`.
    #[error("trust store persistence failed: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
