//! Error taxonomy for the remediation pipeline
//!
//! Tier-local errors are recovered by the dispatcher (it falls through to the
//! next tier). Only `Restore` and `Rollback` escape a cycle.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixError {
    /// A pattern matcher classified the error but found nothing actionable.
    #[error("{matcher} matcher found no actionable text")]
    ParseMismatch { matcher: &'static str },

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Could not parse patch: {0}")]
    PatchParse(String),

    #[error("Failed to apply patch to {}: {reason}", path.display())]
    PatchApply { path: PathBuf, reason: String },

    #[error("Learned payload is not a recognized fix")]
    UnrecognizedPayload,

    /// The matcher's fix is already present.
    #[error("Nothing to do: {0}")]
    NothingToDo(String),

    #[error("AI backend error: {0}")]
    Backend(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to restore backup for {}: {source}", path.display())]
    Restore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Test run failed: {0}")]
    TestRun(String),

    #[error("Learning store error: {0}")]
    Store(String),
}

impl FixError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FixError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn apply(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        FixError::PatchApply {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors that must abort the whole cycle instead of falling through.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, FixError::Restore { .. } | FixError::Rollback(_))
    }
}

pub type FixResult<T> = Result<T, FixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_restore_and_rollback_are_unrecoverable() {
        let restore = FixError::Restore {
            path: PathBuf::from("a.py"),
            source: std::io::Error::other("disk gone"),
        };
        assert!(restore.is_unrecoverable());
        assert!(FixError::Rollback("git exploded".into()).is_unrecoverable());
        assert!(!FixError::UnrecognizedPayload.is_unrecoverable());
        assert!(!FixError::FileNotFound(PathBuf::from("x.py")).is_unrecoverable());
    }

    #[test]
    fn test_messages_name_the_path() {
        let err = FixError::apply("src/calc.py", "hunk 1 does not match");
        assert_eq!(
            err.to_string(),
            "Failed to apply patch to src/calc.py: hunk 1 does not match"
        );
    }
}
