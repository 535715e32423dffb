//! Pluggable decision logic for host keys that are not yet in the trust
//! store: accept silently, or ask a human.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::Result;
use crate::lockfile::LockGuard;

/// Verdict for a presented key that is not in the trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Accept,
    Reject,
}

/// Decides the fate of an unknown host key.
///
/// A `Reject` always aborts the in-progress connection attempt; it is never
/// retried automatically.
pub trait TrustPolicy: Send + Sync {
    /// Evaluate an unknown `(host, key_type)` pair. `fingerprint` is the
    /// human-readable SHA256 form, for display only.
    ///
    /// # Errors
    ///
    /// Returns an error if the decision could not be obtained (lock or
    /// prompt I/O failure).
    fn evaluate(&self, host: &str, key_type: &str, fingerprint: &str) -> Result<TrustDecision>;
}

/// Accepts every unknown key. Used when host-key checking is disabled by
/// configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAcceptPolicy;

impl TrustPolicy for AutoAcceptPolicy {
    fn evaluate(&self, host: &str, key_type: &str, _fingerprint: &str) -> Result<TrustDecision> {
        debug!(host = %host, key_type = %key_type, "auto-accepting unknown host key");
        Ok(TrustDecision::Accept)
    }
}

/// Synchronous yes/no prompt channel.
///
/// `flush_pending` must be called before `confirm` so a stale keystroke
/// buffered on the channel cannot be silently consumed as the answer to an
/// unrelated question.
pub trait Prompt: Send + Sync {
    /// Discard any buffered, unread input on the prompt channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be drained.
    fn flush_pending(&self) -> io::Result<()>;

    /// Display `message` and block until one line of input arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt cannot be written or the answer read.
    fn confirm(&self, message: &str) -> io::Result<String>;
}

/// Prompt over the process's stdin/stderr.
///
/// stderr carries the question so stdout stays free for the caller's own
/// protocol traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn flush_pending(&self) -> io::Result<()> {
        #[cfg(unix)]
        // Safety: tcflush on the stdin descriptor only discards kernel-side
        // buffered input; no memory is touched.
        unsafe {
            libc::tcflush(libc::STDIN_FILENO, libc::TCIFLUSH);
        }
        Ok(())
    }

    fn confirm(&self, message: &str) -> io::Result<String> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{message}")?;
        stderr.flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer)
    }
}

/// Interactive confirmation policy.
///
/// Serializes the prompt across sibling worker processes through two advisory
/// file locks (the runtime-wide process token and the prompt token), both
/// held only for the duration of one question and released on every exit
/// path.
pub struct ConfirmPolicy<P = StdinPrompt> {
    prompt: P,
    process_lock: PathBuf,
    prompt_lock: PathBuf,
}

impl<P: Prompt> ConfirmPolicy<P> {
    pub fn new(prompt: P, process_lock: PathBuf, prompt_lock: PathBuf) -> Self {
        Self {
            prompt,
            process_lock,
            prompt_lock,
        }
    }
}

fn authenticity_message(host: &str, key_type: &str, fingerprint: &str) -> String {
    format!(
        "The authenticity of host '{host}' can't be established.\n\
         The {key_type} key fingerprint is {fingerprint}.\n\
         Are you sure you want to continue connecting (yes/no)? "
    )
}

impl<P: Prompt> TrustPolicy for ConfirmPolicy<P> {
    fn evaluate(&self, host: &str, key_type: &str, fingerprint: &str) -> Result<TrustDecision> {
        let _process = LockGuard::acquire(&self.process_lock)?;
        let _prompt = LockGuard::acquire(&self.prompt_lock)?;

        self.prompt.flush_pending()?;
        let answer = self
            .prompt
            .confirm(&authenticity_message(host, key_type, fingerprint))?;

        match answer.trim().to_lowercase().as_str() {
            "" | "y" | "yes" => Ok(TrustDecision::Accept),
            other => {
                warn!(host = %host, answer = %other, "host key declined at prompt");
                Ok(TrustDecision::Reject)
            }
        }
    }
}
