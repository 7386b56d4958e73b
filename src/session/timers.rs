//! Named timer handles owned by the session
//!
//! At most one timer per [`TimerKind`] is armed at a time. An expiring timer
//! posts a [`TimerFired`] message into the session inbox; the generation
//! stamp lets the session drop expiries that raced with a cancel.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Handshake,
    Ping,
    PingAck,
    Reconnect,
}

/// Expiry notification delivered through the session inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct TimerTable<M> {
    tx: mpsc::UnboundedSender<M>,
    slots: HashMap<TimerKind, ArmedTimer>,
    next_generation: u64,
}

impl<M> TimerTable<M>
where
    M: From<TimerFired> + Send + 'static,
{
    pub fn new(tx: mpsc::UnboundedSender<M>) -> Self {
        Self {
            tx,
            slots: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Arm `kind` to fire after `delay`, replacing any timer of the same kind
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);

        let generation = self.next_generation;
        self.next_generation += 1;

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(M::from(TimerFired { kind, generation }));
        });

        trace!(?kind, generation, delay_ms = delay.as_millis() as u64, "Timer armed");
        self.slots.insert(kind, ArmedTimer { generation, handle });
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.slots.remove(&kind) {
            timer.handle.abort();
            trace!(?kind, generation = timer.generation, "Timer cancelled");
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.slots.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }

    pub fn armed_count(&self) -> usize {
        self.slots.len()
    }

    /// Claim an expiry. Returns false for a stale one (cancelled or re-armed
    /// after it was posted), which the caller must ignore.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.slots.get(&fired.kind) {
            Some(timer) if timer.generation == fired.generation => {
                self.slots.remove(&fired.kind);
                true
            }
            _ => false,
        }
    }
}

impl<M> Drop for TimerTable<M> {
    fn drop(&mut self) {
        for (_, timer) in self.slots.drain() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut timers = TimerTable::new(tx);

        timers.arm(TimerKind::Ping, Duration::from_secs(5));
        assert!(timers.is_armed(TimerKind::Ping));

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Ping);
        assert!(timers.accept(fired));
        assert!(!timers.is_armed(TimerKind::Ping));
        // Claiming the same expiry twice is rejected
        assert!(!timers.accept(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_makes_previous_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut timers = TimerTable::new(tx);

        timers.arm(TimerKind::Reconnect, Duration::from_millis(10));
        timers.arm(TimerKind::Reconnect, Duration::from_millis(20));
        assert_eq!(timers.armed_count(), 1);

        let fired = rx.recv().await.unwrap();
        assert!(timers.accept(fired));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "replaced timer must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_silences_every_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut timers = TimerTable::new(tx);

        timers.arm(TimerKind::Handshake, Duration::from_millis(5));
        timers.arm(TimerKind::Ping, Duration::from_millis(5));
        timers.arm(TimerKind::PingAck, Duration::from_millis(5));
        timers.arm(TimerKind::Reconnect, Duration::from_millis(5));
        timers.cancel_all();
        assert_eq!(timers.armed_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut timers = TimerTable::new(tx);
        assert!(!timers.accept(TimerFired {
            kind: TimerKind::Handshake,
            generation: 99,
        }));
    }
}
