//! Reconnection state machine for live subscriptions.
//!
//! ```text
//!                on_failure                 on_failure
//!   Connected ─────────────► Reconnecting ─────────────► Reconnecting
//!       ▲                    (delay = d0)               (delay = min(d·f, max))
//!       │                         │
//!       └──── on_connected ◄──────┘
//!
//!   any state ──── abandon ────► Abandoned
//! ```
//!
//! The delay is plain data and every transition takes the current instant as
//! an argument, so the machine runs the same under a real or a paused clock.

use std::time::Duration;

use tokio::time::Instant;

use crate::ext::BackoffConfig;

/// Where the live leg of a subscription currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting { delay: Duration, attempt: u32 },
    Abandoned,
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStep {
    /// Wait this long before the next attempt
    pub delay: Duration,
    /// Consecutive failures so far, this one included
    pub attempt: u32,
    /// Time since the connection was last known to be healthy
    pub disconnected_for: Duration,
    /// Set once per outage, the first time `disconnected_for` passes the
    /// alert threshold
    pub alert: bool,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    state: ConnectionState,
    healthy_at: Instant,
    alerted: bool,
}

impl Backoff {
    /// A machine that considers the connection healthy as of `now`.
    pub fn new(config: BackoffConfig, now: Instant) -> Self {
        Self {
            config,
            state: ConnectionState::Connected,
            healthy_at: now,
            alerted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last successful connection.
    pub fn attempts(&self) -> u32 {
        match self.state {
            ConnectionState::Reconnecting { attempt, .. } => attempt,
            _ => 0,
        }
    }

    /// Record that the connection delivered something at `now`.
    pub fn record_activity(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            self.healthy_at = now;
        }
    }

    /// A connection attempt failed, or an open connection broke or stalled.
    pub fn on_failure(&mut self, now: Instant) -> BackoffStep {
        let (delay, attempt) = match self.state {
            ConnectionState::Reconnecting { delay, attempt } => {
                (self.grow(delay), attempt.saturating_add(1))
            }
            _ => (self.config.initial_delay.min(self.config.max_delay), 1),
        };
        self.state = ConnectionState::Reconnecting { delay, attempt };

        let disconnected_for = now.saturating_duration_since(self.healthy_at);
        let alert = !self.alerted && disconnected_for >= self.config.alert_threshold;
        if alert {
            self.alerted = true;
        }

        BackoffStep {
            delay,
            attempt,
            disconnected_for,
            alert,
        }
    }

    /// A connection was established at `now`. Returns the number of failed
    /// attempts that preceded it.
    pub fn on_connected(&mut self, now: Instant) -> u32 {
        let attempts = self.attempts();
        self.state = ConnectionState::Connected;
        self.healthy_at = now;
        self.alerted = false;
        attempts
    }

    pub fn abandon(&mut self) {
        self.state = ConnectionState::Abandoned;
    }

    fn grow(&self, delay: Duration) -> Duration {
        let factor = if self.config.factor.is_finite() {
            self.config.factor.max(1.0)
        } else {
            1.0
        };
        let next = delay.as_secs_f64() * factor;
        let max = self.config.max_delay;
        if next >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(next)
        }
    }
}
