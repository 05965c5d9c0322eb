//! Error types for webcall-core
//!
//! Errors are grouped into categories so callers can decide how to react:
//!
//! - **Session misuse** - `InvalidOperation`, `Superseded`: a programming error
//!   in the order of session calls. Never retried.
//! - **Registration** - `RegistrationFailed`: the registrar rejected us. The
//!   transport falls back to `Disconnected`; a fresh `connect()` may be tried.
//! - **Timeouts** - `TransportTimeout`: a socket open, registration or
//!   unregistration exceeded its deadline. Eligible for caller retry.
//! - **Recovery** - `RecoveryInProgress`: `connect()` while the transport is
//!   recovering on its own.
//!
//! Network loss during steady state is *not* an error. It shows up only as the
//! `Dying` / `Recovering` statuses on the event stream.
//!
//! ```rust
//! use webcall_core::ClientError;
//!
//! let err = ClientError::invalid_operation("reject after accept");
//! assert_eq!(err.category(), "session");
//! assert!(!err.is_recoverable());
//!
//! let err = ClientError::TransportTimeout { operation: "register".into(), duration_ms: 10_000 };
//! assert!(err.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for webcall-core operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Error taxonomy for the calling client.
///
/// `Clone` because a single connect attempt is shared between every caller
/// awaiting it, and each of them receives the same error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Caller misused a session's accept/reject/cancel ordering
    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// A newer hold/unhold request replaced this one before it completed
    #[error("{operation} superseded by a newer request")]
    Superseded { operation: String },

    /// Registrar rejected credentials or contact
    #[error("Registration failed: {reason}")]
    RegistrationFailed { reason: String },

    /// Socket open or registration exceeded its deadline
    #[error("{operation} timed out after {duration_ms}ms")]
    TransportTimeout { operation: String, duration_ms: u64 },

    /// `connect()` called while the transport is recovering on its own
    #[error("Recovery in progress")]
    RecoveryInProgress,

    /// Operation requires a registered transport
    #[error("Not connected")]
    NotConnected,

    /// Underlying engine reported a failure for a session primitive
    #[error("Session {operation} failed: {reason}")]
    SessionFailed { operation: String, reason: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Subscription to {uri} failed: {reason}")]
    SubscriptionFailed { uri: String, reason: String },

    #[error("Media error: {reason}")]
    MediaError { reason: String },

    /// Socket-level failure (probe, websocket handshake, engine transport)
    #[error("Network error: {reason}")]
    NetworkError { reason: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl ClientError {
    /// Create an invalid operation error
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// Create a registration failed error
    pub fn registration_failed(reason: impl Into<String>) -> Self {
        Self::RegistrationFailed { reason: reason.into() }
    }

    /// Create a session failure carrying the engine's cause
    pub fn session_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SessionFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a media error
    pub fn media(reason: impl Into<String>) -> Self {
        Self::MediaError { reason: reason.into() }
    }

    /// Create a network error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError { reason: reason.into() }
    }

    /// Create a configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Check if this error is worth an automatic retry
    ///
    /// Registration rejections are final for the attempt that produced them;
    /// only timeouts and socket-level failures are retried by the transport.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::TransportTimeout { .. } | ClientError::NetworkError { .. } => true,

            ClientError::InvalidOperation { .. }
            | ClientError::Superseded { .. }
            | ClientError::RegistrationFailed { .. }
            | ClientError::InvalidConfiguration { .. } => false,

            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::InvalidOperation { .. }
            | ClientError::Superseded { .. }
            | ClientError::SessionFailed { .. }
            | ClientError::SessionNotFound { .. } => "session",

            ClientError::RegistrationFailed { .. } => "registration",

            ClientError::TransportTimeout { .. }
            | ClientError::RecoveryInProgress
            | ClientError::NotConnected
            | ClientError::NetworkError { .. } => "transport",

            ClientError::SubscriptionFailed { .. } => "subscription",

            ClientError::MediaError { .. } => "media",

            ClientError::InvalidConfiguration { .. } => "configuration",

            ClientError::InternalError { .. } => "system",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_and_network_errors_are_recoverable() {
        assert!(ClientError::network("reset").is_recoverable());
        assert!(ClientError::TransportTimeout {
            operation: "open".into(),
            duration_ms: 5000
        }
        .is_recoverable());

        assert!(!ClientError::registration_failed("403 Forbidden").is_recoverable());
        assert!(!ClientError::RecoveryInProgress.is_recoverable());
        assert!(!ClientError::invalid_operation("accept twice").is_recoverable());
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = ClientError::session_failed("accept", "488 Not Acceptable Here");
        assert_eq!(err.to_string(), "Session accept failed: 488 Not Acceptable Here");

        let err = ClientError::Superseded { operation: "hold".into() };
        assert_eq!(err.to_string(), "hold superseded by a newer request");
    }
}
