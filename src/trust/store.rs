//! In-memory host-key trust store backed by a `known_hosts`-style file.
//!
//! One line per trusted key, `hostname key_type base64_public_key`. Entries
//! accepted during the current process are flagged so the rewrite can append
//! them after everything that was already on disk.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Result;

/// A single trusted `(host, key_type) -> public key` association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub host: String,
    pub key_type: String,
    pub public_key: Vec<u8>,
    /// Set exactly once, when the trust policy accepts this key during the
    /// current process, and never cleared. Sole discriminator for rewrite
    /// ordering.
    pub added_this_session: bool,
}

impl KeyEntry {
    fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            self.host,
            self.key_type,
            BASE64.encode(&self.public_key)
        )
    }
}

/// Outcome of checking a presented key against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    /// Exact entry present.
    Match,
    /// The host has a key of this type on record, but a different one.
    Mismatch { expected_fingerprint: String },
    /// No entry for this `(host, key_type)` pair.
    Unknown,
}

/// Ordered collection of [`KeyEntry`], loaded from the trust file.
///
/// Only ever mutated by appending accepted entries; pre-existing entries are
/// never removed or reordered.
#[derive(Debug, Default)]
pub struct TrustStore {
    entries: Vec<KeyEntry>,
}

impl TrustStore {
    /// Load the store from `path`. A missing or empty file yields an empty
    /// store, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let mut store = Self::default();
        let merged = store.merge_from_file(path)?;
        debug!(
            path = %path.display(),
            entries = merged,
            "loaded trust store"
        );
        Ok(store)
    }

    /// Re-read `path` and append every entry the store has not seen, flagged
    /// as pre-existing, in file order. Called once at load and again under
    /// the flush lock so keys trusted by concurrently-finished sibling
    /// processes are not lost.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn merge_from_file(&mut self, path: &Path) -> Result<usize> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut merged = 0;
        for line in content.lines() {
            let Some((host, key_type, public_key)) = parse_line(line) else {
                continue;
            };
            if self.position(&host, &key_type, &public_key).is_some() {
                continue;
            }
            self.entries.push(KeyEntry {
                host,
                key_type,
                public_key,
                added_this_session: false,
            });
            merged += 1;
        }
        Ok(merged)
    }

    /// All entries recorded for `host`.
    #[must_use]
    pub fn lookup(&self, host: &str) -> Vec<&KeyEntry> {
        self.entries.iter().filter(|e| e.host == host).collect()
    }

    /// Check a presented key against the store.
    #[must_use]
    pub fn check(&self, host: &str, key_type: &str, public_key: &[u8]) -> KeyMatch {
        let mut mismatch = None;
        for entry in self.entries.iter().filter(|e| e.host == host) {
            if entry.key_type != key_type {
                continue;
            }
            if entry.public_key == public_key {
                return KeyMatch::Match;
            }
            mismatch = Some(KeyMatch::Mismatch {
                expected_fingerprint: fingerprint(&entry.public_key),
            });
        }
        mismatch.unwrap_or(KeyMatch::Unknown)
    }

    /// Record a key accepted by the trust policy, flagged as added this
    /// session. A no-op if the identical entry is already present.
    pub fn record(&mut self, host: &str, key_type: &str, public_key: &[u8]) {
        if self.position(host, key_type, public_key).is_some() {
            return;
        }
        info!(host = %host, key_type = %key_type, "recording newly trusted host key");
        self.entries.push(KeyEntry {
            host: host.to_string(),
            key_type: key_type.to_string(),
            public_key: public_key.to_vec(),
            added_this_session: true,
        });
    }

    /// Whether any key was accepted during this process's lifetime.
    #[must_use]
    pub fn any_session_additions(&self) -> bool {
        self.entries.iter().any(|e| e.added_this_session)
    }

    /// Serialize the store: pre-existing entries first, in loaded order, then
    /// session additions in acceptance order.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `out` fails.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for entry in self.entries.iter().filter(|e| !e.added_this_session) {
            writeln!(out, "{}", entry.to_line())?;
        }
        for entry in self.entries.iter().filter(|e| e.added_this_session) {
            writeln!(out, "{}", entry.to_line())?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, host: &str, key_type: &str, public_key: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.host == host && e.key_type == key_type && e.public_key == public_key)
    }
}

/// Parse one trust-file line into `(host, key_type, public_key)`.
///
/// Comments, blank lines, hashed (`|1|...`) hostnames, and lines whose key
/// field is not valid base64 are skipped.
fn parse_line(line: &str) -> Option<(String, String, Vec<u8>)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let host = parts.next()?;
    let key_type = parts.next()?;
    let key_b64 = parts.next()?;
    let public_key = BASE64.decode(key_b64).ok()?;
    Some((host.to_string(), key_type.to_string(), public_key))
}

/// SHA256 fingerprint of a public key, rendered the way OpenSSH does.
#[must_use]
pub fn fingerprint(public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Trust-file host label: bare hostname for the default port, `[host]:port`
/// otherwise.
#[must_use]
pub fn lookup_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}
