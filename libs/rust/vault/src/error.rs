//! Renewal error types using thiserror 2.0.
//!
//! One enum per collaborator, each classified through
//! [`rust_common::Retryable`]. Messages never carry secret material.

use rust_common::{PlatformError, Retryable};
use thiserror::Error;

/// Auth exchange failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Network-level failure, timeout, or a server-side (5xx/429) status
    #[error("Auth endpoint unreachable: {0}")]
    Unreachable(String),

    /// Non-success status or a response without `auth.client_token` or
    /// `auth.lease_duration`
    #[error("Invalid auth response: {0}")]
    InvalidResponse(String),
}

/// Dynamic credential fetch and lease lookup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network-level failure, timeout, or a server-side (5xx/429) status
    #[error("Secret store unreachable: {0}")]
    Unreachable(String),

    /// The token lacks a policy for the path
    #[error("Permission denied for path: {path}")]
    Forbidden {
        /// Requested path
        path: String,
    },

    /// Response is missing an expected field or is not JSON
    #[error("Malformed response from {path}: missing or invalid `{field}`")]
    Malformed {
        /// Requested path
        path: String,
        /// Offending field name
        field: &'static str,
    },
}

/// Config sink failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// The sink could not be reached or did not acknowledge in time;
    /// the credential set may or may not have been applied.
    #[error("Config sink unreachable: {0}")]
    Unreachable(String),

    /// The sink refused the credential set; nothing was applied.
    #[error("Config sink rejected credentials: {0}")]
    Rejected(String),
}

/// Lease tracker invariant violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The caller's view of the current (or pending) lease is stale
    #[error("Conflicting current lease: expected {expected:?}, found {found:?}")]
    ConflictingCurrent {
        /// Lease id the caller expected
        expected: Option<String>,
        /// Lease id actually held
        found: Option<String>,
    },

    /// Another renewal for the same credential path is in flight
    #[error("Renewal already in progress for {path}")]
    RenewalInProgress {
        /// Credential path
        path: String,
    },

    /// The tracker holds no lease with this id
    #[error("Unknown lease: {0}")]
    UnknownLease(String),
}

/// Lease revocation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RevokeError {
    /// Network-level failure, timeout, or a server-side status
    #[error("Revocation endpoint unreachable: {0}")]
    Unreachable(String),

    /// The token may not revoke this lease
    #[error("Revocation forbidden for lease {0}")]
    Forbidden(String),

    /// Any other non-success status
    #[error("Revocation rejected with status {0}")]
    Rejected(u16),
}

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Invalid URL format
    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl {
        /// Variable or field name
        field: String,
        /// Parser message
        reason: String,
    },

    /// Missing required field
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// Environment variable parse error
    #[error("Failed to parse {name}: {reason}")]
    ParseError {
        /// Variable name
        name: String,
        /// Parser message
        reason: String,
    },

    /// Renewal policy out of range
    #[error("Invalid renewal policy: {0}")]
    InvalidPolicy(String),
}

/// Errors raised while building an engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Shared infrastructure failure (HTTP client construction)
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Tracker invariant violated
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl Retryable for AuthError {
    fn is_retryable(&self) -> bool {
        // A bad response may come from a store rolling through a deploy.
        true
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Forbidden { .. })
    }
}

impl Retryable for CommitError {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for RevokeError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl FetchError {
    /// Create an unreachable error.
    #[must_use]
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    /// Create a malformed-response error.
    #[must_use]
    pub fn malformed(path: impl Into<String>, field: &'static str) -> Self {
        Self::Malformed {
            path: path.into(),
            field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FetchError::malformed("database/creds/app", "lease_id");
        assert_eq!(
            err.to_string(),
            "Malformed response from database/creds/app: missing or invalid `lease_id`"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AuthError::InvalidResponse("400".to_string()).is_retryable());
        assert!(FetchError::unreachable("timeout").is_retryable());
        assert!(FetchError::malformed("p", "data").is_retryable());
        assert!(!FetchError::Forbidden { path: "p".to_string() }.is_retryable());
        assert!(RevokeError::Unreachable("reset".to_string()).is_retryable());
        assert!(!RevokeError::Rejected(400).is_retryable());
    }

    #[test]
    fn test_from_platform_error() {
        let err: EngineError = PlatformError::invalid_input("zero timeout").into();
        assert!(matches!(err, EngineError::Platform(_)));
    }
}
