//! Session actor
//!
//! One task owns the connection state, the reassembly buffer, the liveness and
//! reconnect logic and every timer. Commands from the [`Session`] handle,
//! transport notifications and timer expiries all arrive as messages and are
//! handled one at a time, so no state here is ever touched concurrently.
//!
//! Every connection attempt gets a new epoch. Transport messages carry the
//! epoch they were produced for and anything from an older attempt is dropped,
//! which keeps a late read or write failure from tearing down its successor.
//!
//! [`Session`]: crate::session::Session

use super::client::MessageIdCounter;
use super::events::{InboundMessage, SessionEvent};
use super::liveness::LivenessMonitor;
use super::reassembler::StreamReassembler;
use super::reconnect::{ReconnectDecision, ReconnectScheduler};
use super::state::ConnectionState;
use super::timers::{TimerFired, TimerKind, TimerTable};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{Codec, CodecError, ConnectReturnCode, Frame, PacketKind, QoS, Subscription};
use crate::transport::{BoxedStream, Transport};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Requests sent by the public handle
pub(crate) enum Command {
    Connect,
    /// An already encoded application frame
    Write { kind: PacketKind, bytes: Bytes },
    Subscribe {
        subscriptions: Vec<Subscription>,
        bytes: Bytes,
    },
    Unsubscribe { filters: Vec<String>, bytes: Bytes },
    Reconnect,
    Disconnect {
        graceful: bool,
        done: oneshot::Sender<()>,
    },
    Shutdown { done: oneshot::Sender<()> },
}

/// Notifications produced inside the session
pub(crate) enum SessionInput {
    Transport { epoch: u64, event: TransportEvent },
    Timer(TimerFired),
}

impl From<TimerFired> for SessionInput {
    fn from(fired: TimerFired) -> Self {
        SessionInput::Timer(fired)
    }
}

pub(crate) enum TransportEvent {
    Established(BoxedStream),
    Failed(io::Error),
    Data(Bytes),
    End,
    Error(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectMode {
    /// Connection lost; reconnect if enabled
    Lost,
    /// Requested by the application; never reconnects
    Manual { graceful: bool },
}

/// I/O tasks for one open transport
struct Connection {
    outbound: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Stop reading and let the writer flush what is queued before shutting the stream down
    fn close(self) {
        self.reader.abort();
        drop(self.outbound);
    }

    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub(crate) struct SessionActor {
    config: Arc<SessionConfig>,
    codec: Arc<dyn Codec>,
    transport: Arc<dyn Transport>,
    inbox: mpsc::UnboundedSender<SessionInput>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    messages: mpsc::UnboundedSender<InboundMessage>,
    timers: TimerTable<SessionInput>,
    reassembler: StreamReassembler,
    liveness: LivenessMonitor,
    reconnect: ReconnectScheduler,
    epoch: u64,
    pending_connect: Option<JoinHandle<()>>,
    connection: Option<Connection>,
    subscriptions: Vec<Subscription>,
    ids: Arc<MessageIdCounter>,
}

impl SessionActor {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        codec: Arc<dyn Codec>,
        transport: Arc<dyn Transport>,
        inbox: mpsc::UnboundedSender<SessionInput>,
        state_tx: watch::Sender<ConnectionState>,
        events: broadcast::Sender<SessionEvent>,
        messages: mpsc::UnboundedSender<InboundMessage>,
        ids: Arc<MessageIdCounter>,
    ) -> Self {
        Self {
            liveness: LivenessMonitor::new(config.keepalive, config.ping_timeout),
            reconnect: ReconnectScheduler::new(config.reconnect_period),
            timers: TimerTable::new(inbox.clone()),
            config,
            codec,
            transport,
            inbox,
            state: ConnectionState::Disconnected,
            state_tx,
            events,
            messages,
            reassembler: StreamReassembler::new(),
            epoch: 0,
            pending_connect: None,
            connection: None,
            subscriptions: Vec::new(),
            ids,
        }
    }

    /// Drain both inboxes until shutdown or until every handle is dropped
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
    ) {
        info!(client_id = %self.config.client_id, "Session task started");

        loop {
            tokio::select! {
                biased;

                Some(input) = inputs.recv() => self.handle_input(input),

                command = commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.disconnect(None, DisconnectMode::Manual { graceful: true });
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All session handles dropped");
                        self.disconnect(None, DisconnectMode::Manual { graceful: true });
                        break;
                    }
                },
            }
        }

        info!(client_id = %self.config.client_id, "Session task stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => match self.state {
                ConnectionState::Disconnected => self.connect(),
                state => debug!(?state, "Connect ignored"),
            },
            Command::Write { kind, bytes } => {
                self.write_application(kind, bytes);
            }
            Command::Subscribe {
                subscriptions,
                bytes,
            } => {
                if self.write_application(PacketKind::Subscribe, bytes) {
                    self.remember(subscriptions);
                }
            }
            Command::Unsubscribe { filters, bytes } => {
                if self.write_application(PacketKind::Unsubscribe, bytes) {
                    self.subscriptions
                        .retain(|s| !filters.iter().any(|f| f == &s.filter));
                }
            }
            Command::Reconnect => self.manual_reconnect(),
            Command::Disconnect { graceful, done } => {
                self.disconnect(None, DisconnectMode::Manual { graceful });
                let _ = done.send(());
            }
            // Handled by the run loop
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Timer(fired) => {
                if !self.timers.accept(fired) {
                    trace!(kind = ?fired.kind, generation = fired.generation, "Stale timer ignored");
                    return;
                }
                match fired.kind {
                    TimerKind::Handshake => self.on_handshake_timeout(),
                    TimerKind::Ping => self.on_ping_due(),
                    TimerKind::PingAck => self.on_ping_ack_timeout(),
                    TimerKind::Reconnect => self.on_reconnect_due(),
                }
            }
            SessionInput::Transport { epoch, event } => {
                if epoch != self.epoch || !self.state.has_transport() {
                    trace!(epoch, current = self.epoch, "Stale transport event ignored");
                    return;
                }
                match event {
                    TransportEvent::Established(stream) => self.on_transport_established(stream),
                    TransportEvent::Failed(e) => {
                        warn!("Transport connect failed: {}", e);
                        self.fail(SessionError::Transport(e));
                    }
                    TransportEvent::Data(chunk) => self.on_data(&chunk),
                    TransportEvent::End => {
                        warn!("Connection closed by peer");
                        self.disconnect(None, DisconnectMode::Lost);
                    }
                    TransportEvent::Error(e) => self.fail(SessionError::Transport(e)),
                }
            }
        }
    }

    fn connect(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;

        self.reassembler.reset();
        self.reconnect.record_attempt(Instant::now());
        self.set_state(ConnectionState::AwaitingHandshakeAck);
        self.timers
            .arm(TimerKind::Handshake, self.config.connect_timeout);

        info!(
            host = %self.config.endpoint.host,
            port = self.config.endpoint.port,
            tls = self.config.endpoint.tls,
            epoch,
            "Opening transport connection"
        );

        let transport = Arc::clone(&self.transport);
        let endpoint = self.config.endpoint.clone();
        let inbox = self.inbox.clone();
        self.pending_connect = Some(tokio::spawn(async move {
            let event = match transport.connect(&endpoint).await {
                Ok(stream) => TransportEvent::Established(stream),
                Err(e) => TransportEvent::Failed(e),
            };
            let _ = inbox.send(SessionInput::Transport { epoch, event });
        }));
    }

    fn on_transport_established(&mut self, stream: BoxedStream) {
        self.pending_connect = None;

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, self.epoch, self.inbox.clone()));
        let writer = tokio::spawn(write_loop(write_half, queue, self.epoch, self.inbox.clone()));
        self.connection = Some(Connection {
            outbound,
            reader,
            writer,
        });

        debug!("Transport established, sending handshake");
        let handshake = self.codec.encode_handshake(&self.config);
        self.send_or_fail(PacketKind::Connect, handshake);
    }

    fn on_data(&mut self, chunk: &[u8]) {
        self.reassembler.extend(chunk);
        loop {
            match self.reassembler.next_frame(self.codec.as_ref()) {
                Ok(Some(frame)) => {
                    self.on_frame(frame);
                    if !self.state.has_transport() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    self.fail(SessionError::Codec(e));
                    return;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        debug!(kind = %frame.kind, message_id = ?frame.message_id, "Packet received");
        self.emit(SessionEvent::PacketReceive(frame.kind));

        if self.state == ConnectionState::AwaitingHandshakeAck {
            if frame.kind == PacketKind::ConnAck {
                self.on_connack(&frame);
            } else {
                self.emit(SessionEvent::UnhandledMessage(frame));
            }
            return;
        }

        match (frame.kind, frame.message_id) {
            (PacketKind::Publish, _) => self.on_publish(&frame),
            (PacketKind::PingResp, _) => {
                if let Some(next) = self.liveness.pong_received() {
                    self.timers.cancel(TimerKind::PingAck);
                    self.timers.arm(TimerKind::Ping, next);
                }
            }
            (PacketKind::PubRel, Some(id)) => {
                let pubcomp = self.codec.encode_pubcomp(id);
                self.send_or_fail(PacketKind::PubComp, pubcomp);
            }
            (PacketKind::PubRec, Some(id)) => {
                let pubrel = self.codec.encode_pubrel(id);
                self.send_or_fail(PacketKind::PubRel, pubrel);
            }
            (
                kind @ (PacketKind::PubAck
                | PacketKind::PubComp
                | PacketKind::SubAck
                | PacketKind::UnsubAck),
                Some(message_id),
            ) => self.emit(SessionEvent::Acknowledged { kind, message_id }),
            _ => self.emit(SessionEvent::UnhandledMessage(frame)),
        }
    }

    fn on_connack(&mut self, frame: &Frame) {
        let ack = match self.codec.decode_connack(frame) {
            Ok(ack) => ack,
            Err(e) => return self.fail(SessionError::Codec(e)),
        };
        if ack.code != ConnectReturnCode::Success {
            warn!("Broker refused connection: {:?}", ack.code);
            return self.fail(SessionError::ConnectionRefused(ack.code));
        }

        self.timers.cancel(TimerKind::Handshake);
        self.set_state(ConnectionState::Connected);

        if let Some(delay) = self.liveness.start() {
            self.timers.arm(TimerKind::Ping, delay);
        }

        if self.reconnect.handshake_completed() {
            info!(
                reconnects = self.reconnect.reconnects(),
                "Session reconnected"
            );
            self.emit(SessionEvent::Reconnect);
            if self.config.resubscribe {
                self.resubscribe();
            }
        } else {
            self.emit(SessionEvent::Connect {
                session_present: ack.session_present,
            });
        }
    }

    /// Queue the message for the application; only a queued message is acknowledged
    fn on_publish(&mut self, frame: &Frame) {
        let publish = match self.codec.decode_publish_body(frame) {
            Ok(publish) => publish,
            Err(e) => return self.fail(SessionError::Codec(e)),
        };

        let qos = publish.qos;
        let message_id = frame.message_id;
        let message = InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos,
            retain: publish.retain,
            message_id,
        };
        if self.messages.send(message).is_err() {
            warn!(?message_id, "Message receiver dropped, leaving publish unacknowledged");
            return;
        }

        let ack_kind = match qos {
            QoS::AtMostOnce => return,
            QoS::AtLeastOnce => PacketKind::PubAck,
            QoS::ExactlyOnce => PacketKind::PubRec,
        };
        if let Some(id) = message_id {
            let ack = self.codec.encode_ack(id, qos);
            self.send_or_fail(ack_kind, ack);
        }
    }

    fn resubscribe(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        let message_id = self.ids.next_id();
        info!(
            count = self.subscriptions.len(),
            message_id, "Restoring subscriptions"
        );
        let subscribe = self.codec.encode_subscribe(&self.subscriptions, message_id);
        self.send_or_fail(PacketKind::Subscribe, subscribe);
    }

    fn remember(&mut self, subscriptions: Vec<Subscription>) {
        for subscription in subscriptions {
            match self
                .subscriptions
                .iter_mut()
                .find(|s| s.filter == subscription.filter)
            {
                Some(existing) => existing.qos = subscription.qos,
                None => self.subscriptions.push(subscription),
            }
        }
    }

    fn on_handshake_timeout(&mut self) {
        if self.state != ConnectionState::AwaitingHandshakeAck {
            return;
        }
        warn!(
            timeout_ms = self.config.connect_timeout.as_millis() as u64,
            "Handshake not acknowledged in time"
        );
        self.emit(SessionEvent::Timeout);
        self.fail(SessionError::HandshakeTimeout(self.config.connect_timeout));
    }

    fn on_ping_due(&mut self) {
        let Some(ack_timeout) = self.liveness.ping_due() else {
            return;
        };
        let sent = self
            .codec
            .encode_ping()
            .map_err(SessionError::from)
            .and_then(|bytes| self.write_frame(PacketKind::PingReq, bytes));

        match sent {
            Ok(()) => self.timers.arm(TimerKind::PingAck, ack_timeout),
            Err(e) => {
                self.liveness.ping_send_failed();
                warn!("Failed to send ping: {}", e);
                self.report(e);
            }
        }
    }

    fn on_ping_ack_timeout(&mut self) {
        if self.liveness.ack_timed_out() {
            warn!(
                timeout_ms = self.liveness.ack_timeout().as_millis() as u64,
                "Ping response not received"
            );
            self.fail(SessionError::LivenessTimeout(self.liveness.ack_timeout()));
        }
    }

    fn on_reconnect_due(&mut self) {
        if self.reconnect.fire() && self.state == ConnectionState::Reconnecting {
            info!(attempt = self.reconnect.attempts(), "Reconnecting");
            self.connect();
        }
    }

    fn manual_reconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "Reconnect ignored");
            return;
        }
        match self.reconnect.request(Instant::now()) {
            ReconnectDecision::Schedule { delay } => {
                self.set_state(ConnectionState::Reconnecting);
                self.timers.arm(TimerKind::Reconnect, delay);
            }
            ReconnectDecision::AlreadyScheduled => {}
            ReconnectDecision::Disabled => self.connect(),
        }
    }

    /// Report a connection-fatal error and drop the connection
    fn fail(&mut self, cause: SessionError) {
        self.disconnect(Some(cause), DisconnectMode::Lost);
    }

    /// Tear the connection down only for errors that are fatal to it
    fn report(&mut self, cause: SessionError) {
        if cause.is_fatal_to_connection() {
            self.fail(cause);
        } else {
            warn!("Session error: {}", cause);
            self.emit(SessionEvent::error(cause));
        }
    }

    /// The single teardown path
    fn disconnect(&mut self, cause: Option<SessionError>, mode: DisconnectMode) {
        if let Some(cause) = cause {
            error!("Session error: {}", cause);
            self.emit(SessionEvent::error(cause));
        }

        let previous = self.state;
        if mode == DisconnectMode::Lost && !previous.has_transport() {
            return;
        }

        self.timers.cancel_all();
        self.liveness.stop();
        self.reassembler.reset();
        if let Some(task) = self.pending_connect.take() {
            task.abort();
        }
        if let DisconnectMode::Manual { .. } = mode {
            self.reconnect.cancel();
        }

        if let Some(connection) = self.connection.take() {
            let graceful = matches!(mode, DisconnectMode::Manual { graceful: true });
            if graceful && previous.is_connected() {
                self.send_disconnect(&connection);
                connection.close();
            } else {
                connection.abort();
            }
        }

        if previous.has_transport() {
            self.emit(SessionEvent::Close);
        }
        if previous.is_connected() {
            self.emit(SessionEvent::Offline);
        }

        let next = match mode {
            DisconnectMode::Manual { .. } => ConnectionState::Disconnected,
            DisconnectMode::Lost => match self.reconnect.request(Instant::now()) {
                ReconnectDecision::Schedule { delay } => {
                    self.timers.arm(TimerKind::Reconnect, delay);
                    ConnectionState::Reconnecting
                }
                ReconnectDecision::AlreadyScheduled => ConnectionState::Reconnecting,
                ReconnectDecision::Disabled => ConnectionState::Disconnected,
            },
        };
        self.set_state(next);
    }

    /// Best effort; a failure is reported but never blocks teardown
    fn send_disconnect(&mut self, connection: &Connection) {
        let result = self.codec.encode_disconnect().map_err(SessionError::from);
        match result.and_then(|bytes| {
            connection
                .outbound
                .send(bytes)
                .map_err(|_| writer_stopped())
        }) {
            Ok(()) => {
                debug!(kind = %PacketKind::Disconnect, "Packet sent");
                self.emit(SessionEvent::PacketSend(PacketKind::Disconnect));
            }
            Err(e) => {
                warn!("Failed to send disconnect: {}", e);
                self.emit(SessionEvent::error(e));
            }
        }
    }

    /// Write a frame the handle encoded. Returns false when nothing was written.
    fn write_application(&mut self, kind: PacketKind, bytes: Bytes) -> bool {
        if !self.state.can_publish() {
            // The state changed after the handle checked it
            debug!(kind = %kind, "Dropping write");
            self.report(SessionError::not_connected(self.state));
            return false;
        }
        match self.write_frame(kind, bytes) {
            Ok(()) => true,
            Err(e) => {
                self.report(e);
                false
            }
        }
    }

    fn write_frame(&mut self, kind: PacketKind, bytes: Bytes) -> SessionResult<()> {
        let Some(connection) = self.connection.as_ref() else {
            return Err(SessionError::not_connected(self.state));
        };
        connection
            .outbound
            .send(bytes)
            .map_err(|_| writer_stopped())?;
        debug!(kind = %kind, "Packet sent");
        self.emit(SessionEvent::PacketSend(kind));
        Ok(())
    }

    fn send_or_fail(&mut self, kind: PacketKind, encoded: Result<Bytes, CodecError>) {
        let result = encoded
            .map_err(SessionError::from)
            .and_then(|bytes| self.write_frame(kind, bytes));
        if let Err(e) = result {
            self.report(e);
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        ConnectionState::log_transition(self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn emit(&self, event: SessionEvent) {
        trace!(event = event.name(), "Emitting session event");
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

fn writer_stopped() -> SessionError {
    SessionError::Transport(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "connection writer has stopped",
    ))
}

fn transport_input(epoch: u64, event: TransportEvent) -> SessionInput {
    SessionInput::Transport { epoch, event }
}

async fn read_loop<R>(mut reader: R, epoch: u64, inbox: mpsc::UnboundedSender<SessionInput>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => TransportEvent::End,
            Ok(_) => TransportEvent::Data(buf.split().freeze()),
            Err(e) => TransportEvent::Error(e),
        };
        let done = !matches!(event, TransportEvent::Data(_));
        if inbox.send(transport_input(epoch, event)).is_err() || done {
            return;
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    epoch: u64,
    inbox: mpsc::UnboundedSender<SessionInput>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = queue.recv().await {
        if let Err(e) = write_all_flush(&mut writer, &bytes).await {
            let _ = inbox.send(transport_input(epoch, TransportEvent::Error(e)));
            return;
        }
    }
    // Queue closed by a graceful disconnect
    let _ = writer.shutdown().await;
}

async fn write_all_flush<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}
