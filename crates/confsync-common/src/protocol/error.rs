use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfsyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("config service returned HTTP {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("namespace {namespace} not found, it may not have been released yet")]
    NamespaceNotFound { namespace: String },

    #[error("no config service available from meta server {0}")]
    NoAvailableService(String),

    #[error("failed to load configuration for namespace {namespace}: {reason}")]
    LoadFailed { namespace: String, reason: String },

    #[error("initial load failed for namespace {namespace}: {reason}")]
    InitialLoadFailed { namespace: String, reason: String },

    #[error("property {key} value {value:?} cannot be parsed as {expected}")]
    TypeMismatch {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfsyncError {
    /// Wraps any displayable failure as a transport error.
    pub fn transport(err: impl Display) -> Self {
        ConfsyncError::Transport(err.to_string())
    }

    /// Whether iterating to another endpoint (or backing off and retrying)
    /// may succeed where this attempt failed.
    ///
    /// `NamespaceNotFound` is retryable: the namespace may simply not have
    /// been released yet, and a later release makes the same request succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConfsyncError::Transport(_)
                | ConfsyncError::UnexpectedStatus { .. }
                | ConfsyncError::NamespaceNotFound { .. }
                | ConfsyncError::NoAvailableService(_)
                | ConfsyncError::LoadFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConfsyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(ConfsyncError::Transport("connection refused".to_string()).is_retryable());
        assert!(ConfsyncError::UnexpectedStatus {
            status: 500,
            url: "http://cs/configs/a/default/app".to_string()
        }
        .is_retryable());
        assert!(ConfsyncError::NamespaceNotFound {
            namespace: "app".to_string()
        }
        .is_retryable());
        assert!(ConfsyncError::NoAvailableService("http://meta".to_string()).is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!ConfsyncError::TypeMismatch {
            key: "timeout".to_string(),
            value: "abc".to_string(),
            expected: "i64",
        }
        .is_retryable());

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!ConfsyncError::Json(json_err).is_retryable());
    }

    #[test]
    fn test_namespace_not_found_hint() {
        let err = ConfsyncError::NamespaceNotFound {
            namespace: "app.yml".to_string(),
        };
        assert!(err.to_string().contains("may not have been released"));
    }
}
