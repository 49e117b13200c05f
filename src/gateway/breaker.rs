//! Per-agent circuit breaker
//!
//! Masks transient agent failures from clients: after a run of
//! consecutive send failures the breaker opens and sends are refused
//! without touching the socket; after the open timeout a single probe is
//! allowed (half-open) and its outcome decides between closing the
//! circuit and re-opening it for another full timeout.

use std::time::{Duration, Instant};

use tracing::{info, warn};

pub const FAILURE_THRESHOLD: u32 = 10;
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    threshold: u32,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_policy(FAILURE_THRESHOLD, OPEN_TIMEOUT)
    }

    pub fn with_policy(threshold: u32, open_timeout: Duration) -> Self {
        CircuitBreaker {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            threshold,
            open_timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a send attempt may be issued now. An expired open circuit
    /// transitions to half-open and lets exactly this attempt through.
    pub fn can_send_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.open_until.map_or(true, |t| now >= t) {
                    self.state = CircuitState::HalfOpen;
                    info!("circuit entering half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn can_send(&mut self) -> bool {
        self.can_send_at(Instant::now())
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.consecutive_failures += 1;

        let trip = match self.state {
            // A half-open probe failing re-opens immediately.
            CircuitState::HalfOpen => true,
            _ => self.consecutive_failures >= self.threshold,
        };

        if trip && self.state != CircuitState::Open {
            self.state = CircuitState::Open;
            self.open_until = Some(now + self.open_timeout);
            warn!(
                failures = self.consecutive_failures,
                timeout_secs = self.open_timeout.as_secs(),
                "circuit opened"
            );
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.open_until = None;
            info!("circuit closed (recovered)");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
