use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breaker that stops hammering a degraded exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub failure_threshold: u32,
    pub cooldown_secs: i64,
    state: BreakerState,
    consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open { until: DateTime<Utc> },
    /// Cooldown elapsed; one trial call is in flight
    HalfOpen,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, 30)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_secs: i64) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown_secs,
            state: BreakerState::Closed,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a call may go out now. Moves Open -> HalfOpen once the cooldown
    /// has elapsed and lets exactly that one trial call through.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<(), Duration> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open { until } if now >= until => {
                tracing::info!("Circuit breaker half-open, probing exchange");
                self.state = BreakerState::HalfOpen;
                Ok(())
            }
            BreakerState::Open { until } => Err(until - now),
            // Trial call already in flight
            BreakerState::HalfOpen => Err(Duration::zero()),
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            tracing::info!("Circuit breaker closed after successful trial call");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures += 1;

        let trip = match self.state {
            BreakerState::HalfOpen => true,
            _ => self.consecutive_failures >= self.failure_threshold,
        };

        if trip {
            let until = now + Duration::seconds(self.cooldown_secs);
            tracing::warn!(
                failures = self.consecutive_failures,
                cooldown_secs = self.cooldown_secs,
                "Circuit breaker opened"
            );
            self.state = BreakerState::Open { until };
        }
    }

    /// Failure that says nothing about exchange health (auth, validation):
    /// releases a half-open trial call without tripping or resetting the count.
    pub fn record_neutral(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
        }
    }
}
