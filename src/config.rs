use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

/// Process-wide transport configuration, handed in by the orchestrating
/// runtime. Per-connection material (host, user, password, key override)
/// arrives separately in [`crate::ssh::ConnectParams`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Verify host keys against the trust file. When disabled, unknown keys
    /// are auto-accepted for the session and never prompted for.
    #[serde(default = "default_true")]
    pub host_key_checking: bool,

    /// Persist keys accepted this session back to the trust file on close.
    /// Only consulted when `host_key_checking` is also enabled.
    #[serde(default = "default_true")]
    pub record_host_keys: bool,

    /// Trust file location. Defaults to `~/.ssh/known_hosts`.
    #[serde(default)]
    pub trust_file: Option<PathBuf>,

    /// Per-run default private key file, used when a connection does not
    /// carry its own. `~` is expanded.
    #[serde(default)]
    pub private_key_file: Option<String>,

    /// Handshake timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Lock file serializing whole-process critical sections across sibling
    /// workers. Derived from the trust file when unset.
    #[serde(default)]
    pub process_lock_file: Option<PathBuf>,

    /// Lock file serializing the interactive confirmation prompt across
    /// sibling workers. Derived from the trust file when unset.
    #[serde(default)]
    pub prompt_lock_file: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host_key_checking: true,
            record_host_keys: true,
            trust_file: None,
            private_key_file: None,
            connect_timeout_seconds: default_connect_timeout(),
            process_lock_file: None,
            prompt_lock_file: None,
        }
    }
}

impl TransportConfig {
    /// Resolve the trust file path, falling back to `~/.ssh/known_hosts`.
    #[must_use]
    pub fn trust_file(&self) -> PathBuf {
        self.trust_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".ssh").join("known_hosts"))
                .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
        })
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Mutex token shared with sibling workers for whole-process sections.
    #[must_use]
    pub fn process_lock_file(&self) -> PathBuf {
        self.process_lock_file
            .clone()
            .unwrap_or_else(|| derived_lock_path(&self.trust_file(), "process"))
    }

    /// Mutex token shared with sibling workers for the confirmation prompt.
    #[must_use]
    pub fn prompt_lock_file(&self) -> PathBuf {
        self.prompt_lock_file
            .clone()
            .unwrap_or_else(|| derived_lock_path(&self.trust_file(), "prompt"))
    }
}

/// Sibling lock path for `trust_file`: the filename is replaced with a dotted
/// `.{name}.{tag}.lock` variant in the same directory.
fn derived_lock_path(trust_file: &std::path::Path, tag: &str) -> PathBuf {
    let name = trust_file
        .file_name()
        .map_or_else(|| "known_hosts".to_string(), |n| n.to_string_lossy().into_owned());
    trust_file.with_file_name(format!(".{name}.{tag}.lock"))
}
