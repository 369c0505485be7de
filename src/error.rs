/*!
Error kinds that callers need to tell apart from ordinary failures.

Most fallible operations in this crate return [anyhow::Result]; the types
here exist so that cancellation, data corruption and replay failures stay
recognisable through `downcast_ref` after they have been wrapped.
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// A long-running operation was cancelled by the user.
#[derive(Clone, Copy, Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Data on disk does not match what its metadata promises.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// A snapshot's shards or manifest are unreadable or inconsistent.
    #[error("snapshot {snapshot_id} is corrupt: {reason}")]
    CorruptSnapshot {
        /// The snapshot that failed its checks.
        snapshot_id: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A snapshot referenced by a timeline or the registry is gone.
    #[error("snapshot {snapshot_id} is missing")]
    MissingSnapshot {
        /// The snapshot that could not be found.
        snapshot_id: String,
    },
}

/// Replay of a recorded command failed; the live table may hold the
/// restored snapshot with only the commands before `position` applied.
#[derive(Debug, Error)]
#[error("replay failed at command {position} ({label}): {reason}")]
pub struct ReplayError {
    /// Position of the offending command in its timeline.
    pub position: i64,
    /// The command's user-facing label.
    pub label: String,
    /// Why it could not be applied.
    pub reason: String,
}

/// True if `err` is a [Cancelled] at any level of its chain.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}

/// Cooperative cancellation flag checked between shards of long-running
/// operations. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation. Observed at the next check point.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Err([Cancelled]) once cancellation has been requested.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            Err(Cancelled.into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_cancelled_survives_context_wrapping() {
        let token = CancelToken::new();
        token.cancel();
        let err = token
            .check()
            .context("stacking tables")
            .expect_err("token was cancelled");
        assert!(is_cancelled(&err));
    }

    #[test]
    fn test_fresh_token_passes_check() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.check().expect("fresh token");
    }
}
