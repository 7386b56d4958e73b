//! Observable session events
//!
//! Status events are broadcast to every receiver obtained from
//! [`Session::events`](crate::session::Session::events). Receivers only see
//! events emitted after they subscribed, and a receiver that falls behind
//! skips the oldest ones. Application messages never travel this way: they
//! are queued without loss on the channel returned by
//! [`Session::messages`](crate::session::Session::messages).

use crate::error::SessionError;
use crate::protocol::{Frame, PacketKind, QoS};
use bytes::Bytes;
use std::sync::Arc;

/// Application message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Wire id, absent for qos 0
    pub message_id: Option<u16>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// First successful handshake
    Connect { session_present: bool },
    /// Successful handshake after a dropped connection
    Reconnect,
    /// The transport was torn down
    Close,
    /// The session left `Connected`
    Offline,
    Error(Arc<SessionError>),
    /// Handshake was not acknowledged within the connect timeout
    Timeout,
    PacketSend(PacketKind),
    PacketReceive(PacketKind),
    /// The broker acknowledged one of our id-bearing requests
    Acknowledged { kind: PacketKind, message_id: u16 },
    /// A recognised frame the session has no handler for
    UnhandledMessage(Frame),
}

impl SessionEvent {
    pub fn error(error: SessionError) -> Self {
        SessionEvent::Error(Arc::new(error))
    }

    /// Short name used in logs and CLI output
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connect { .. } => "connect",
            SessionEvent::Reconnect => "reconnect",
            SessionEvent::Close => "close",
            SessionEvent::Offline => "offline",
            SessionEvent::Error(_) => "error",
            SessionEvent::Timeout => "timeout",
            SessionEvent::PacketSend(_) => "packetsend",
            SessionEvent::PacketReceive(_) => "packetreceive",
            SessionEvent::Acknowledged { .. } => "acknowledged",
            SessionEvent::UnhandledMessage(_) => "unhandled_message",
        }
    }
}
