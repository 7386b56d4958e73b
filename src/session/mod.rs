//! Client session management
//!
//! The session owns connection establishment, the handshake, keepalive
//! probing, reconnection with backoff and frame reassembly. It runs as a
//! single actor task; [`Session`] is the handle applications hold.
//!
//! ```text
//! Disconnected --connect()--> AwaitingHandshakeAck --ack--> Connected
//!      ^                         |   ^                          |
//!      |                timeout  |   | backoff elapsed          | error / close / liveness timeout
//!      |                         v   |                          v
//!      +---- reconnect disabled --- Reconnecting <--------------+
//! ```

mod client;
mod event_loop;
mod events;
pub mod liveness;
pub mod reassembler;
pub mod reconnect;
mod state;
pub mod timers;

pub use client::{MessageIdCounter, Session};
pub use events::{InboundMessage, SessionEvent};
pub use liveness::{LivenessMonitor, LivenessPhase};
pub use reassembler::StreamReassembler;
pub use reconnect::{compute_delay, ReconnectDecision, ReconnectScheduler};
pub use state::ConnectionState;
pub use timers::{TimerFired, TimerKind, TimerTable};
