//! Per-connection liveness tracking.
//!
//! The relay pings each connection every `interval`. A ping left unanswered
//! for `timeout` counts as liveness loss. [`Heartbeat`] is a pure state
//! machine driven by the caller's clock so it can be tested without a socket.

use std::time::Duration;

use tokio::time::Instant;

/// Default pause between pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default time allowed for a pong to arrive.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// What the connection loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame now.
    SendPing,
    /// The last ping went unanswered for too long.
    TimedOut,
    /// Nothing to do yet.
    Wait,
}

/// Ping/pong bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    last_ping_sent_at: Instant,
    awaiting_pong: bool,
}

impl Heartbeat {
    /// Starts tracking at `started`; the first ping is due one interval later.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration, started: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_ping_sent_at: started,
            awaiting_pong: false,
        }
    }

    /// Advances the state machine to `now`.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        let elapsed = now.saturating_duration_since(self.last_ping_sent_at);
        if self.awaiting_pong {
            if elapsed >= self.timeout {
                // Start a fresh cycle so the next interval pings again.
                self.awaiting_pong = false;
                self.last_ping_sent_at = now;
                return HeartbeatAction::TimedOut;
            }
            return HeartbeatAction::Wait;
        }
        if elapsed >= self.interval {
            self.awaiting_pong = true;
            self.last_ping_sent_at = now;
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Wait
    }

    /// Records a pong from the peer.
    pub const fn on_pong(&mut self) {
        self.awaiting_pong = false;
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub const fn awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    /// How often [`poll`](Self::poll) needs calling to honour both deadlines.
    #[must_use]
    pub fn poll_period(&self) -> Duration {
        self.interval.min(self.timeout).max(Duration::from_millis(1))
    }
}
