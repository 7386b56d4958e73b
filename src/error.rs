//! Error taxonomy for the session
//!
//! Every error that is fatal to the current connection funnels through the
//! session's single disconnect path and is reported as an event. Only
//! `NotConnected` and encode-time `Codec` errors are returned synchronously
//! from the handle. Configuration problems are [`ConfigError`]s and surface
//! before a session exists.
//!
//! [`ConfigError`]: crate::config::ConfigError

use crate::protocol::{CodecError, ConnectReturnCode};
use crate::session::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("Liveness timeout: no ping response within {0:?}")]
    LivenessTimeout(Duration),

    #[error("Handshake timeout: no acknowledgement within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Connection refused by broker: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("Session task has stopped")]
    SessionClosed,
}

impl SessionError {
    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }

    /// Whether this error tears down the current connection
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            SessionError::Codec(_)
                | SessionError::Transport(_)
                | SessionError::LivenessTimeout(_)
                | SessionError::HandshakeTimeout(_)
                | SessionError::ConnectionRefused(_)
        )
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            SessionError::Codec(CodecError::PayloadTooLarge {
                size: 300,
                max: 256,
            }),
            SessionError::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            )),
            SessionError::LivenessTimeout(Duration::from_secs(10)),
            SessionError::HandshakeTimeout(Duration::from_secs(30)),
            SessionError::not_connected(ConnectionState::Disconnected),
            SessionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword),
            SessionError::SessionClosed,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_not_connected_mentions_state() {
        let error = SessionError::not_connected(ConnectionState::Reconnecting);
        assert_eq!(
            error.to_string(),
            "Not connected - current state: Reconnecting"
        );
        assert!(!error.is_fatal_to_connection());
    }

    #[test]
    fn test_refusal_names_return_code() {
        let error = SessionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(
            error.to_string(),
            "Connection refused by broker: NotAuthorized"
        );
    }

    #[test]
    fn test_connection_fatal_classification() {
        assert!(SessionError::LivenessTimeout(Duration::from_secs(1)).is_fatal_to_connection());
        assert!(
            SessionError::Codec(CodecError::InvalidTopic("a/#/b".to_string()))
                .is_fatal_to_connection()
        );
        assert!(!SessionError::SessionClosed.is_fatal_to_connection());
        assert!(!SessionError::not_connected(ConnectionState::AwaitingHandshakeAck).is_fatal_to_connection());
    }
}
