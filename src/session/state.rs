//! Connection state for a session
//!
//! One enum replaces independent "socket connected", "protocol connected" and
//! "reconnecting" flags. Boolean views are derived from it.

use tracing::{info, warn};

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport and no pending attempt
    #[default]
    Disconnected,
    /// Transport opening or open, handshake sent, acknowledgement pending
    AwaitingHandshakeAck,
    /// Handshake acknowledged; application traffic allowed
    Connected,
    /// Between a lost connection and the next attempt
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a transport connection is being opened or is open
    pub fn has_transport(self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingHandshakeAck | ConnectionState::Connected
        )
    }

    pub fn is_reconnecting(self) -> bool {
        matches!(self, ConnectionState::Reconnecting)
    }

    /// Application frames may only be written while connected
    pub fn can_publish(self) -> bool {
        self.is_connected()
    }

    pub fn log_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::AwaitingHandshakeAck, ConnectionState::Connected) => {
                info!("Session handshake acknowledged, connection established");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting) => {
                warn!("Session connection lost, reconnection scheduled");
            }
            (ConnectionState::AwaitingHandshakeAck, ConnectionState::Reconnecting) => {
                warn!("Connection attempt failed, reconnection scheduled");
            }
            (ConnectionState::Reconnecting, ConnectionState::AwaitingHandshakeAck) => {
                info!("Starting reconnection attempt");
            }
            (_, ConnectionState::Disconnected) => {
                info!("Session disconnected");
            }
            _ => {
                info!("Session state: {:?} -> {:?}", from, to);
            }
        }
    }
}
