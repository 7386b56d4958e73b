//! Mock implementations for testing
//!
//! [`MockTransport`] hands out in-memory duplex pipes instead of sockets and
//! records when each connection attempt happened. The client end of the
//! newest pipe can be made to fail every write with
//! [`MockTransport::break_writes`]. [`MockBroker`] drives the
//! far end of one pipe with the real codec, so tests can script exactly what
//! the broker says and when.

use crate::config::Endpoint;
use crate::protocol::{Codec, Frame, MqttCodec, PacketKind, PublishOptions, QoS};
use crate::session::StreamReassembler;
use crate::transport::{BoxedStream, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Scripted outcome for one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
}

struct MockState {
    script: VecDeque<ConnectOutcome>,
    attempts: Vec<Instant>,
    /// Write switch of the most recently accepted connection
    broken: Option<Arc<AtomicBool>>,
}

/// Client end of a mock connection
struct MockStream {
    inner: DuplexStream,
    broken: Arc<AtomicBool>,
}

impl MockStream {
    fn check_writable(&self) -> io::Result<()> {
        if self.broken.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock connection broken",
            ));
        }
        Ok(())
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(e) = self.check_writable() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(e) = self.check_writable() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Transport that connects to in-memory brokers
///
/// Attempts follow the script pushed with [`MockTransport::push_outcome`];
/// once the script is exhausted every attempt is accepted.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    accepted: mpsc::UnboundedSender<DuplexStream>,
}

impl MockTransport {
    /// Returns the transport and the receiver of broker-side pipe ends, one
    /// per accepted connection
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                attempts: Vec::new(),
                broken: None,
            })),
            accepted,
        };
        (transport, rx)
    }

    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(outcome);
        }
    }

    /// When each connection attempt was made
    pub fn attempts(&self) -> Vec<Instant> {
        self.state
            .lock()
            .map(|state| state.attempts.clone())
            .unwrap_or_default()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts().len()
    }

    /// Make every further write on the newest connection fail with
    /// `BrokenPipe`. Reads and later connections are unaffected.
    pub fn break_writes(&self) {
        if let Some(broken) = self.state.lock().ok().and_then(|state| state.broken.clone()) {
            broken.store(true, Ordering::Release);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _endpoint: &Endpoint) -> io::Result<BoxedStream> {
        let broken = Arc::new(AtomicBool::new(false));
        let outcome = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "mock state poisoned"))?;
            state.attempts.push(Instant::now());
            let outcome = state.script.pop_front().unwrap_or(ConnectOutcome::Accept);
            if outcome == ConnectOutcome::Accept {
                state.broken = Some(Arc::clone(&broken));
            }
            outcome
        };

        match outcome {
            ConnectOutcome::Refuse => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock connection refused",
            )),
            ConnectOutcome::Accept => {
                let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
                self.accepted
                    .send(server)
                    .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "no broker listening"))?;
                Ok(Box::new(MockStream {
                    inner: client,
                    broken,
                }))
            }
        }
    }
}

/// Broker side of one mock connection
pub struct MockBroker {
    stream: DuplexStream,
    codec: MqttCodec,
    reassembler: StreamReassembler,
}

impl MockBroker {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            codec: MqttCodec::default(),
            reassembler: StreamReassembler::new(),
        }
    }

    /// Wait for the next accepted connection
    pub async fn accept(accepted: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Option<Self> {
        accepted.recv().await.map(Self::new)
    }

    pub fn codec(&self) -> &MqttCodec {
        &self.codec
    }

    /// Next frame from the client, or `None` once the client closed the pipe
    pub async fn read_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            match self.reassembler.next_frame(&self.codec) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(_) => return None,
            }
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.reassembler.extend(&buf[..n]),
            }
        }
    }

    /// Read frames until one of `kind` arrives, skipping everything else
    pub async fn expect(&mut self, kind: PacketKind) -> Option<Frame> {
        while let Some(frame) = self.read_frame().await {
            if frame.kind == kind {
                return Some(frame);
            }
        }
        None
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    pub async fn send_connack(&mut self, code: u8) -> io::Result<()> {
        self.send_raw(&[0x20, 0x02, 0x00, code]).await
    }

    /// Read the CONNECT and accept it
    pub async fn handshake(&mut self) -> io::Result<()> {
        self.expect(PacketKind::Connect)
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no CONNECT"))?;
        self.send_connack(0).await
    }

    pub async fn send_pingresp(&mut self) -> io::Result<()> {
        self.send_raw(&[0xD0, 0x00]).await
    }

    pub async fn send_suback(&mut self, message_id: u16, granted: &[QoS]) -> io::Result<()> {
        let mut body = message_id.to_be_bytes().to_vec();
        body.extend(granted.iter().map(|qos| *qos as u8));
        let mut frame = vec![0x90, body.len() as u8];
        frame.extend(body);
        self.send_raw(&frame).await
    }

    pub async fn send_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        message_id: Option<u16>,
    ) -> io::Result<()> {
        let options = PublishOptions {
            qos,
            ..Default::default()
        };
        let bytes: Bytes = self
            .codec
            .encode_publish(topic, payload, options, message_id)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.send_raw(&bytes).await
    }

    /// Close the broker end; the client sees end of stream
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Collect every frame that arrives within `duration`
    pub async fn drain_for(&mut self, duration: Duration) -> Vec<Frame> {
        let mut frames = Vec::new();
        let deadline = Instant::now() + duration;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.read_frame()).await {
            frames.push(frame);
        }
        frames
    }
}
