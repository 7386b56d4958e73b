//! Shared harness for session integration tests
//!
//! Every test runs on a paused tokio clock, so timeouts of tens of seconds
//! elapse instantly and timings are exact.

#![allow(dead_code)]

use mqtt_session::testing::{MockBroker, MockTransport};
use mqtt_session::{
    ConnectionState, Endpoint, InboundMessage, MqttCodec, Session, SessionConfig, SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

/// Upper bound for anything a test waits on
pub const PATIENCE: Duration = Duration::from_secs(600);

pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::new(Endpoint::plain("broker.test", 1883), "session-test");
    config.keepalive = Duration::from_secs(60);
    config.ping_timeout = Duration::from_secs(10);
    config.reconnect_period = Some(Duration::from_secs(1));
    config.connect_timeout = Duration::from_secs(30);
    config
}

pub struct Harness {
    pub session: Session,
    pub transport: MockTransport,
    pub accepted: mpsc::UnboundedReceiver<DuplexStream>,
    pub events: broadcast::Receiver<SessionEvent>,
    pub messages: mpsc::UnboundedReceiver<InboundMessage>,
}

pub fn start(config: SessionConfig) -> Harness {
    let (transport, accepted) = MockTransport::pair();
    let session = Session::with_parts(
        config,
        Arc::new(MqttCodec::default()),
        Arc::new(transport.clone()),
    );
    let events = session.events();
    let messages = session.messages().expect("message receiver already taken");
    Harness {
        session,
        transport,
        accepted,
        events,
        messages,
    }
}

impl Harness {
    /// Broker end of the next accepted connection
    pub async fn accept(&mut self) -> MockBroker {
        timeout(PATIENCE, MockBroker::accept(&mut self.accepted))
            .await
            .expect("timed out waiting for a connection attempt")
            .expect("transport dropped")
    }

    /// Connect, complete the handshake and wait for the `Connect` event
    pub async fn connected(&mut self) -> MockBroker {
        self.session.connect().unwrap();
        let mut broker = self.accept().await;
        broker.handshake().await.unwrap();
        self.next_event(|e| matches!(e, SessionEvent::Connect { .. }))
            .await;
        broker
    }

    /// Skip events until one matches
    pub async fn next_event<F>(&mut self, mut wanted: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if wanted(&event) => return event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        };
        timeout(PATIENCE, wait)
            .await
            .expect("timed out waiting for a session event")
    }

    /// Next application message delivered by the session
    pub async fn next_message(&mut self) -> InboundMessage {
        timeout(PATIENCE, self.messages.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("message channel closed")
    }

    /// Messages already delivered and not yet consumed
    pub fn drain_messages(&mut self) -> Vec<InboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Events already emitted and not yet consumed
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return events,
            }
        }
    }

    pub async fn wait_state(&self, expected: ConnectionState) {
        let mut state = self.session.state_watch();
        timeout(PATIENCE, state.wait_for(|s| *s == expected))
            .await
            .expect("timed out waiting for state")
            .expect("session task stopped");
    }
}

pub fn count<F>(events: &[SessionEvent], wanted: F) -> usize
where
    F: Fn(&SessionEvent) -> bool,
{
    events.iter().filter(|event| wanted(event)).count()
}
