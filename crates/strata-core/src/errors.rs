use serde::{Deserialize, Serialize};

use crate::level::{ContextKey, Level};

/// One failed operation inside a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub index: usize,
    pub key: ContextKey,
    pub kind: String,
    pub message: String,
}

/// Typed error taxonomy for context operations.
/// Every variant except `CacheUnavailable` is surfaced to callers.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context not found: {key}")]
    NotFound { key: ContextKey },

    #[error("version {sequence} not found in history of {key}")]
    VersionNotFound { key: ContextKey, sequence: u64 },

    #[error("missing ancestor at level {level}{}", id.as_deref().map(|i| format!(" ({i})")).unwrap_or_default())]
    MissingAncestor { level: Level, id: Option<String> },

    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: ContextKey,
        expected: u64,
        actual: u64,
    },

    #[error("validation failed{}: {reason}", key.as_ref().map(|k| format!(" for {k}")).unwrap_or_default())]
    Validation {
        key: Option<ContextKey>,
        reason: String,
    },

    #[error("{key} has {dependents} dependent context(s)")]
    HasDependents { key: ContextKey, dependents: usize },

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("batch failed: {} operation(s) failed", failures.len())]
    BatchPartialFailure { failures: Vec<BatchFailure> },

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("storage error: {0}")]
    Storage(String),
}

impl ContextError {
    pub fn validation(key: Option<&ContextKey>, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.cloned(),
            reason: reason.into(),
        }
    }

    /// Stable classification string for wire errors and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::MissingAncestor { .. } => "missing_ancestor",
            Self::VersionConflict { .. } => "version_conflict",
            Self::Validation { .. } => "validation_error",
            Self::HasDependents { .. } => "has_dependents",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::BatchPartialFailure { .. } => "batch_partial_failure",
            Self::Subscription(_) => "subscription_error",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Storage(_) => "storage_error",
        }
    }

    /// The offending key, when the error names one.
    pub fn key(&self) -> Option<ContextKey> {
        match self {
            Self::NotFound { key }
            | Self::VersionNotFound { key, .. }
            | Self::VersionConflict { key, .. }
            | Self::HasDependents { key, .. } => Some(key.clone()),
            Self::Validation { key, .. } => key.clone(),
            Self::MissingAncestor { level, id } => id.as_ref().map(|i| ContextKey::new(*level, i.clone())),
            _ => None,
        }
    }

    /// Whether re-reading and retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::DeadlineExceeded)
    }
}

pub type Result<T, E = ContextError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ContextError::NotFound { key: ContextKey::task("t1") }.kind(), "not_found");
        assert_eq!(
            ContextError::VersionNotFound { key: ContextKey::task("t1"), sequence: 9 }.kind(),
            "version_not_found"
        );
        assert_eq!(ContextError::DeadlineExceeded.kind(), "deadline_exceeded");
    }

    #[test]
    fn version_conflict_is_retryable() {
        let err = ContextError::VersionConflict {
            key: ContextKey::project("p1"),
            expected: 1,
            actual: 2,
        };
        assert!(err.is_retryable());
        assert_eq!(err.key(), Some(ContextKey::project("p1")));
        assert!(!ContextError::validation(None, "bad").is_retryable());
    }

    #[test]
    fn messages_name_the_key() {
        let err = ContextError::HasDependents {
            key: ContextKey::branch("b1"),
            dependents: 2,
        };
        assert_eq!(err.to_string(), "branch:b1 has 2 dependent context(s)");

        let err = ContextError::MissingAncestor {
            level: Level::Branch,
            id: Some("b9".into()),
        };
        assert_eq!(err.to_string(), "missing ancestor at level branch (b9)");
        assert_eq!(err.key(), Some(ContextKey::branch("b9")));

        let err = ContextError::validation(Some(&ContextKey::task("t2")), "title is required");
        assert_eq!(err.to_string(), "validation failed for task:t2: title is required");
    }
}
