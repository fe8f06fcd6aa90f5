//! Error types for peering replication
//!
//! Errors carry the peering name or address they relate to so that a single
//! log line is enough to locate the failing relationship. Variants are grouped
//! by how the stream manager reacts to them:
//!
//! - fatal: surfaced to the establishment workflow, never retried
//! - retryable: recovered locally by address rotation and backoff
//! - resync: the importer asks the exporter for a fresh snapshot

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for peering operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The peering token could not be decoded
    #[error("malformed peering token: {reason}")]
    MalformedToken {
        /// What was wrong with the token
        reason: String,
    },

    /// The peering token carried an expiry that has elapsed
    #[error("peering token expired at {expired_at}")]
    ExpiredToken {
        /// When the token stopped being valid
        expired_at: DateTime<Utc>,
    },

    /// The exporting side refused our identity or secret
    #[error("authentication failed for peering {peering}: {reason}")]
    AuthenticationFailure {
        /// Local name of the peering
        peering: String,
        /// Reason reported by the remote side
        reason: String,
    },

    /// Dialing or talking to a peer server failed
    #[error("connection to {address} failed: {reason}")]
    ConnectionFailure {
        /// Address that failed
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// A sequenced message arrived out of order
    #[error("stale sequence for peering {peering}: expected {expected}, got {got}")]
    StaleSequence {
        /// Local name of the peering
        peering: String,
        /// The sequence number that would have been accepted
        expected: u64,
        /// The sequence number that arrived
        got: u64,
    },

    /// Local state disagrees with an incremental update
    #[error("apply conflict for peering {peering}: {reason}")]
    ApplyConflict {
        /// Local name of the peering
        peering: String,
        /// What disagreed
        reason: String,
    },

    /// A root set was empty, too large, or not parseable
    #[error("invalid trust bundle: {reason}")]
    InvalidTrustBundle {
        /// What was wrong with the bundle
        reason: String,
    },

    /// The peer sent a message that is not valid at this point of the stream
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation
        message: String,
    },

    /// A peering state change that the state machine does not allow
    #[error("invalid state transition for peering {peering}: {from} -> {to}")]
    InvalidStateTransition {
        /// Local name of the peering
        peering: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// No peering exists under the given name or ID
    #[error("peering not found: {peering}")]
    PeeringNotFound {
        /// Name or ID that was looked up
        peering: String,
    },

    /// The peering was deleted by either side
    #[error("peering {peering} is terminated")]
    PeeringTerminated {
        /// Local name of the peering
        peering: String,
    },

    /// The storage collaborator failed
    #[error("storage error [{context}]: {message}")]
    Storage {
        /// Description of what failed
        message: String,
        /// Operation that failed (e.g., "commit", "get")
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a malformed token error
    pub fn malformed_token(reason: impl Into<String>) -> Self {
        Self::MalformedToken {
            reason: reason.into(),
        }
    }

    /// Create an authentication failure for a peering
    pub fn authentication(peering: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AuthenticationFailure {
            peering: peering.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection failure for an address
    pub fn connection(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create an apply conflict for a peering
    pub fn apply_conflict(peering: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ApplyConflict {
            peering: peering.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid trust bundle error
    pub fn invalid_trust_bundle(reason: impl Into<String>) -> Self {
        Self::InvalidTrustBundle {
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(peering: impl Into<String>) -> Self {
        Self::PeeringNotFound {
            peering: peering.into(),
        }
    }

    /// Create a storage error with operation context
    pub fn storage(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the stream manager should retry after this error
    ///
    /// Retryable errors are handled by moving to the next candidate address
    /// and backing off; they never change the peering's state on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailure { .. }
                | Error::Protocol { .. }
                | Error::Storage { .. }
                | Error::InvalidTrustBundle { .. }
                | Error::Internal { .. }
        )
    }

    /// Whether this error is answered by requesting a fresh snapshot
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Error::StaleSequence { .. } | Error::ApplyConflict { .. }
        )
    }

    /// Whether this error must be surfaced and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedToken { .. }
                | Error::ExpiredToken { .. }
                | Error::AuthenticationFailure { .. }
                | Error::PeeringTerminated { .. }
                | Error::PeeringNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_sequence_display() {
        let err = Error::StaleSequence {
            peering: "east".to_string(),
            expected: 4,
            got: 7,
        };
        assert_eq!(
            err.to_string(),
            "stale sequence for peering east: expected 4, got 7"
        );
    }

    #[test]
    fn test_connection_failure_is_retryable() {
        let err = Error::connection("10.0.0.1:8503", "connection refused");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(!err.requires_resync());
    }

    #[test]
    fn test_authentication_failure_is_fatal() {
        let err = Error::authentication("east", "secret already exchanged");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_apply_conflict_requires_resync() {
        let err = Error::apply_conflict("east", "delete of unknown key web");
        assert!(err.requires_resync());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_malformed_token_is_fatal() {
        assert!(Error::malformed_token("bad base64").is_fatal());
    }

    #[test]
    fn test_storage_error_display_includes_context() {
        let err = Error::storage("commit", "disk full");
        assert_eq!(err.to_string(), "storage error [commit]: disk full");
    }

    #[test]
    fn test_internal_error_default_context() {
        match Error::internal("boom") {
            Error::Internal { context, .. } => assert_eq!(context, UNKNOWN_CONTEXT),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
