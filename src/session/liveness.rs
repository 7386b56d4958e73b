//! Pure keepalive decision logic
//!
//! The monitor only decides; the session applies its decisions to the timer
//! table and the transport. The cycle is:
//!
//! ```text
//! Idle --start--> PingScheduled --ping due--> AwaitingResponse
//!   ^                  ^                            |
//!   |                  +-------- pong received -----+
//!   +------------------ ack timeout / stop ---------+
//! ```

use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessPhase {
    Idle,
    PingScheduled,
    AwaitingResponse,
}

/// Drives the ping / ping-response cycle for one connection
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    interval: Duration,
    ack_timeout: Duration,
    phase: LivenessPhase,
    pings_sent: u64,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, ack_timeout: Duration) -> Self {
        Self {
            interval,
            ack_timeout,
            phase: LivenessPhase::Idle,
            pings_sent: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn phase(&self) -> LivenessPhase {
        self.phase
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    /// Connection established. Returns the delay before the first ping, or
    /// `None` when liveness is disabled.
    pub fn start(&mut self) -> Option<Duration> {
        if !self.is_enabled() {
            debug!("Liveness monitoring disabled (zero interval)");
            self.phase = LivenessPhase::Idle;
            return None;
        }
        self.phase = LivenessPhase::PingScheduled;
        Some(self.interval)
    }

    /// Ping timer fired. Returns the ack deadline to arm after sending a ping,
    /// or `None` if no ping was scheduled.
    pub fn ping_due(&mut self) -> Option<Duration> {
        if self.phase != LivenessPhase::PingScheduled {
            return None;
        }
        self.phase = LivenessPhase::AwaitingResponse;
        self.pings_sent += 1;
        Some(self.ack_timeout)
    }

    /// Ping response received. Returns the delay until the next ping, or
    /// `None` for an unsolicited response.
    pub fn pong_received(&mut self) -> Option<Duration> {
        if self.phase != LivenessPhase::AwaitingResponse {
            debug!("Ignoring unsolicited ping response");
            return None;
        }
        self.phase = LivenessPhase::PingScheduled;
        Some(self.interval)
    }

    /// Ack timer fired. Returns true when the connection must be declared dead.
    pub fn ack_timed_out(&mut self) -> bool {
        if self.phase != LivenessPhase::AwaitingResponse {
            return false;
        }
        self.phase = LivenessPhase::Idle;
        true
    }

    /// Sending the ping failed; treated like an ack timeout
    pub fn ping_send_failed(&mut self) {
        self.phase = LivenessPhase::Idle;
    }

    pub fn stop(&mut self) {
        self.phase = LivenessPhase::Idle;
    }
}
