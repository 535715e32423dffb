//! Advisory exclusive file locks used as cross-process mutex tokens.
//!
//! Sibling worker processes share no memory; the confirmation prompt and the
//! trust-file flush are serialized through these locks only. The lock file's
//! contents are irrelevant, it exists purely as a token.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;
use tracing::trace;

/// Holds an exclusive advisory lock on a file for its lifetime.
///
/// The lock is released on drop, unconditionally, so every exit path out of a
/// critical section (normal, rejected, or errored) gives it up before the
/// holder proceeds or propagates.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    /// Acquire an exclusive lock on `path`, blocking until it is available.
    /// The file and its parent directory are created if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be created or locked.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        file.lock_exclusive()?;
        trace!(path = %path.display(), "acquired exclusive lock");
        Ok(Self { file })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
