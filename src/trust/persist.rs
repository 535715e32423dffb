//! Crash-safe merge-and-replace flush of the trust file.
//!
//! The flush never rewrites the trust file in place: a fresh temporary file
//! is written in the same directory, given the original's mode and ownership,
//! and renamed over the canonical path in a single step, so a concurrent
//! reader can never observe a half-written file. The whole sequence runs
//! under an exclusive lock on a sentinel file so sibling worker processes
//! serialize their flushes, and the store is re-merged from disk first so
//! their freshly appended keys are not lost.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::lockfile::LockGuard;
use crate::trust::store::TrustStore;

/// Sentinel lock path for `trust_file`: the filename is replaced with a
/// dotted `.{name}.lock` sibling.
#[must_use]
pub fn lock_path(trust_file: &Path) -> PathBuf {
    let name = trust_file
        .file_name()
        .map_or_else(|| "known_hosts".to_string(), |n| n.to_string_lossy().into_owned());
    trust_file.with_file_name(format!(".{name}.lock"))
}

/// Durably merge this session's newly trusted keys into `trust_file`.
///
/// Holds the flush lock for the whole critical section; releases it on every
/// exit path via the guard.
///
/// # Errors
///
/// Returns an error if the lock cannot be taken, the file cannot be re-read,
/// the temporary file cannot be written, or the rename fails. Callers that
/// must not fail use [`flush_best_effort`].
pub fn flush(store: &mut TrustStore, trust_file: &Path) -> Result<()> {
    let dir = trust_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            TransportError::Persistence(format!(
                "trust file {} has no parent directory",
                trust_file.display()
            ))
        })?;
    fs::create_dir_all(dir)?;

    let _lock = LockGuard::acquire(&lock_path(trust_file))?;

    // Pick up keys appended by sibling processes since our load.
    let merged = store.merge_from_file(trust_file)?;
    if merged > 0 {
        debug!(merged, "merged sibling trust-file entries before flush");
    }

    let original_meta = fs::metadata(trust_file).ok();

    let tmp = write_replacement(store, dir)?;
    apply_original_metadata(tmp.path(), original_meta.as_ref())?;

    tmp.persist(trust_file).map_err(|e| {
        TransportError::Persistence(format!(
            "failed to move replacement trust file into place: {}",
            e.error
        ))
    })?;

    info!(path = %trust_file.display(), entries = store.len(), "trust file rewritten");
    Ok(())
}

/// Write the full replacement trust file as an invisible temporary in `dir`.
/// Nothing at the canonical path changes until the caller renames it.
fn write_replacement(store: &TrustStore, dir: &Path) -> Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    store.write_to(&mut tmp)?;
    tmp.flush()?;
    Ok(tmp)
}

/// Give the replacement file the mode bits and ownership of the original so
/// the rename does not change either. A missing original (first flush ever)
/// leaves the temp file's restrictive defaults in place.
#[cfg(unix)]
fn apply_original_metadata(tmp_path: &Path, original: Option<&fs::Metadata>) -> Result<()> {
    use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};

    let Some(meta) = original else {
        return Ok(());
    };
    fs::set_permissions(tmp_path, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    chown(tmp_path, Some(meta.uid()), Some(meta.gid()))?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_original_metadata(_tmp_path: &Path, _original: Option<&fs::Metadata>) -> Result<()> {
    Ok(())
}

/// Flush, but never fail: any error is logged and swallowed.
///
/// Trust-file durability is best effort. The current session already holds
/// the accepted keys in memory, and a persistence failure must never prevent
/// the underlying transport from being closed.
pub fn flush_best_effort(store: &mut TrustStore, trust_file: &Path) {
    if !store.any_session_additions() {
        return;
    }
    if let Err(e) = flush(store, trust_file) {
        warn!(
            path = %trust_file.display(),
            error = %e,
            "failed to persist newly trusted host keys; continuing"
        );
    }
}
