//! Public session handle
//!
//! [`Session`] is a cheap front for the session actor. Reads of the connection
//! state come from a watch channel, so `publish`, `subscribe` and
//! `unsubscribe` fail synchronously with [`SessionError::NotConnected`]
//! instead of queueing. Inbound application messages arrive on the channel
//! from [`Session::messages`]; everything else is reported through
//! [`SessionEvent`]s.

use super::event_loop::{Command, SessionActor};
use super::events::{InboundMessage, SessionEvent};
use super::state::ConnectionState;
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{Codec, MqttCodec, PacketKind, PublishOptions, QoS, Subscription};
use crate::session_span;
use crate::transport::{TcpTransport, Transport};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, Instrument};

/// Allocates message ids in `1..=65535`, wrapping back to 1
///
/// Shared by every connection attempt of one session.
#[derive(Debug, Default)]
pub struct MessageIdCounter {
    last: AtomicU16,
}

impl MessageIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u16 {
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(successor(last))
            })
            .unwrap_or_else(|last| last);
        successor(previous)
    }

    /// Most recently allocated id, 0 before the first allocation
    pub fn last_id(&self) -> u16 {
        self.last.load(Ordering::Acquire)
    }
}

fn successor(id: u16) -> u16 {
    if id == u16::MAX {
        1
    } else {
        id + 1
    }
}

/// Handle to a running client session
///
/// Must be created inside a tokio runtime. Dropping the last handle
/// disconnects gracefully and stops the session task.
pub struct Session {
    config: Arc<SessionConfig>,
    codec: Arc<dyn Codec>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    ids: Arc<MessageIdCounter>,
}

impl Session {
    /// Session over TCP (or TLS) using the MQTT 3.1.1 codec
    pub fn new(config: SessionConfig) -> Self {
        let codec = Arc::new(MqttCodec::new(config.max_packet_size));
        Self::with_parts(config, codec, Arc::new(TcpTransport::new()))
    }

    pub fn with_parts(
        config: SessionConfig,
        codec: Arc<dyn Codec>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let config = Arc::new(config);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let ids = Arc::new(MessageIdCounter::new());

        let actor = SessionActor::new(
            Arc::clone(&config),
            Arc::clone(&codec),
            transport,
            inbox,
            state_tx,
            events.clone(),
            messages_tx,
            Arc::clone(&ids),
        );
        let span = session_span!(client_id = %config.client_id);
        tokio::spawn(actor.run(command_rx, inbox_rx).instrument(span));

        Self {
            config,
            codec,
            commands,
            state,
            events,
            messages: Mutex::new(Some(messages)),
            ids,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events emitted from now on
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Take the receiver of inbound application messages
    ///
    /// Returns `None` after the first call. Messages queue here until they
    /// are read; a qos 1 or 2 publish is acknowledged to the broker once it
    /// has been queued, and left unacknowledged if the receiver was dropped.
    pub fn messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.messages.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel that follows every state transition
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Start connecting. No effect unless the session is `Disconnected`.
    pub fn connect(&self) -> SessionResult<()> {
        self.send(Command::Connect)
    }

    /// Publish a message and return the id allocated to it
    ///
    /// Qos 0 publishes carry no id on the wire; the returned id only
    /// correlates the call locally.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl AsRef<[u8]>,
        options: PublishOptions,
    ) -> SessionResult<u16> {
        self.ensure_connected()?;
        let message_id = self.ids.next_id();
        let wire_id = (options.qos != QoS::AtMostOnce).then_some(message_id);
        let bytes = self
            .codec
            .encode_publish(topic, payload.as_ref(), options, wire_id)?;

        debug!(topic, message_id, qos = ?options.qos, "Publishing");
        self.send(Command::Write {
            kind: PacketKind::Publish,
            bytes,
        })?;
        Ok(message_id)
    }

    pub fn subscribe(&self, subscriptions: Vec<Subscription>) -> SessionResult<u16> {
        self.ensure_connected()?;
        let message_id = self.ids.next_id();
        let bytes = self.codec.encode_subscribe(&subscriptions, message_id)?;

        debug!(count = subscriptions.len(), message_id, "Subscribing");
        self.send(Command::Subscribe {
            subscriptions,
            bytes,
        })?;
        Ok(message_id)
    }

    pub fn unsubscribe(&self, filters: Vec<String>) -> SessionResult<u16> {
        self.ensure_connected()?;
        let message_id = self.ids.next_id();
        let bytes = self.codec.encode_unsubscribe(&filters, message_id)?;

        debug!(count = filters.len(), message_id, "Unsubscribing");
        self.send(Command::Unsubscribe { filters, bytes })?;
        Ok(message_id)
    }

    /// Start a reconnect sequence from `Disconnected`, honouring the backoff
    /// period. No effect in any other state.
    pub fn reconnect(&self) -> SessionResult<()> {
        self.send(Command::Reconnect)
    }

    /// Tear the connection down without reconnecting. Resolves once the
    /// session is `Disconnected`.
    pub async fn disconnect(&self, graceful: bool) -> SessionResult<()> {
        let (done, finished) = oneshot::channel();
        self.send(Command::Disconnect { graceful, done })?;
        finished.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Disconnect gracefully and stop the session task
    pub async fn shutdown(&self) -> SessionResult<()> {
        let (done, finished) = oneshot::channel();
        self.send(Command::Shutdown { done })?;
        finished.await.map_err(|_| SessionError::SessionClosed)
    }

    fn ensure_connected(&self) -> SessionResult<()> {
        let state = self.state();
        if state.can_publish() {
            Ok(())
        } else {
            Err(SessionError::not_connected(state))
        }
    }

    fn send(&self, command: Command) -> SessionResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let ids = MessageIdCounter::new();
        assert_eq!(ids.last_id(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
        assert_eq!(ids.last_id(), 3);
    }

    #[test]
    fn test_ids_wrap_to_one_skipping_zero() {
        let ids = MessageIdCounter {
            last: AtomicU16::new(u16::MAX - 1),
        };
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 1);
    }
}
