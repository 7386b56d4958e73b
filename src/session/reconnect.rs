//! Reconnection backoff decisions
//!
//! Enforces a minimum spacing between connection attempts and guarantees at
//! most one pending reconnect at a time. The scheduler is pure: it tracks
//! timestamps and flags, and the session arms the actual timer.

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Below this a computed delay is treated as zero
const EFFECTIVELY_ZERO: Duration = Duration::from_millis(1);

/// Result of asking for a reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reconnection is disabled by configuration
    Disabled,
    /// A reconnect is already pending; nothing new was scheduled
    AlreadyScheduled,
    /// Arm the reconnect timer for `delay` (zero means connect on the next turn)
    Schedule { delay: Duration },
}

#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    period: Option<Duration>,
    last_attempt: Option<Instant>,
    scheduled: bool,
    reconnecting: bool,
    attempts: u32,
    reconnects: u64,
}

impl ReconnectScheduler {
    pub fn new(period: Option<Duration>) -> Self {
        Self {
            period,
            last_attempt: None,
            scheduled: false,
            reconnecting: false,
            attempts: 0,
            reconnects: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.period.is_some()
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// True from the moment a reconnect is requested until a handshake succeeds
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    /// Attempts made since the last successful handshake
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Successful reconnections over the life of the session
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// A connection attempt starts now
    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Ask for a reconnect after the connection was lost
    pub fn request(&mut self, now: Instant) -> ReconnectDecision {
        if self.scheduled {
            return ReconnectDecision::AlreadyScheduled;
        }
        let Some(period) = self.period else {
            return ReconnectDecision::Disabled;
        };

        let delay = compute_delay(period, self.last_attempt, now);
        self.scheduled = true;
        self.reconnecting = true;
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempts + 1,
            "Reconnect scheduled"
        );
        ReconnectDecision::Schedule { delay }
    }

    /// Reconnect timer fired. Returns true when a connect attempt should start.
    pub fn fire(&mut self) -> bool {
        if !self.scheduled {
            return false;
        }
        self.scheduled = false;
        self.attempts += 1;
        true
    }

    /// Handshake acknowledged. Returns true when this ends a reconnect
    /// sequence rather than a first connection.
    pub fn handshake_completed(&mut self) -> bool {
        let was_reconnecting = self.reconnecting;
        if was_reconnecting {
            self.reconnects += 1;
        }
        self.reconnecting = false;
        self.scheduled = false;
        self.attempts = 0;
        was_reconnecting
    }

    /// Abandon any pending reconnect (manual disconnect)
    pub fn cancel(&mut self) {
        self.scheduled = false;
        self.reconnecting = false;
        self.attempts = 0;
    }
}

/// `max(0, last_attempt + period - now)`, with sub-millisecond delays rounded to zero
pub fn compute_delay(period: Duration, last_attempt: Option<Instant>, now: Instant) -> Duration {
    let delay = match last_attempt {
        Some(last) => (last + period).saturating_duration_since(now),
        None => Duration::ZERO,
    };
    if delay < EFFECTIVELY_ZERO {
        Duration::ZERO
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_honours_last_attempt() {
        let start = Instant::now();
        let period = Duration::from_millis(5000);

        // Attempt at t=0, disconnect at t=1000 -> wait until t=5000
        let delay = compute_delay(period, Some(start), start + Duration::from_millis(1000));
        assert_eq!(delay, Duration::from_millis(4000));

        // Disconnect after the period already elapsed -> immediate
        let delay = compute_delay(period, Some(start), start + Duration::from_millis(7000));
        assert_eq!(delay, Duration::ZERO);

        // Never attempted -> immediate
        assert_eq!(compute_delay(period, None, start), Duration::ZERO);
    }

    #[test]
    fn test_sub_millisecond_delay_is_zero() {
        let start = Instant::now();
        let delay = compute_delay(
            Duration::from_millis(10),
            Some(start),
            start + Duration::from_micros(9_500),
        );
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn test_disabled_scheduler() {
        let mut scheduler = ReconnectScheduler::new(None);
        assert!(!scheduler.is_enabled());
        assert_eq!(
            scheduler.request(Instant::now()),
            ReconnectDecision::Disabled
        );
        assert!(!scheduler.is_reconnecting());
    }

    #[test]
    fn test_only_one_reconnect_pending() {
        let mut scheduler = ReconnectScheduler::new(Some(Duration::from_secs(1)));
        let now = Instant::now();
        scheduler.record_attempt(now);

        assert!(matches!(
            scheduler.request(now),
            ReconnectDecision::Schedule { .. }
        ));
        assert_eq!(
            scheduler.request(now),
            ReconnectDecision::AlreadyScheduled
        );
        assert!(scheduler.fire());
        assert!(!scheduler.fire());
        assert_eq!(scheduler.attempts(), 1);
    }

    #[test]
    fn test_handshake_distinguishes_reconnect_from_first_connect() {
        let mut scheduler = ReconnectScheduler::new(Some(Duration::from_secs(1)));
        assert!(!scheduler.handshake_completed());

        scheduler.request(Instant::now());
        scheduler.fire();
        assert!(scheduler.is_reconnecting());
        assert!(scheduler.handshake_completed());
        assert!(!scheduler.is_reconnecting());
        assert_eq!(scheduler.reconnects(), 1);
        assert_eq!(scheduler.attempts(), 0);
    }

    #[test]
    fn test_cancel_clears_pending() {
        let mut scheduler = ReconnectScheduler::new(Some(Duration::from_secs(1)));
        scheduler.request(Instant::now());
        scheduler.cancel();
        assert!(!scheduler.is_scheduled());
        assert!(!scheduler.fire());
    }
}
