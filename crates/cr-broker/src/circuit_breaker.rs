//! Three-state circuit breaker
//!
//! CLOSED admits everything and counts consecutive failures. Reaching the
//! failure threshold opens the breaker. OPEN rejects until the cooldown has
//! elapsed since the last failure, then moves to HALF_OPEN and admits trial
//! calls. Enough half-open successes close it again; any half-open failure
//! reopens it immediately.
//!
//! Every operation runs under a single mutex, so state transitions never
//! interleave.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::broker_metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_success_threshold: 3,
        }
    }
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failures: u32,
    pub half_open_successes: u32,
    pub rejected: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    rejected: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                half_open_successes: 0,
                last_failure: None,
                rejected: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admission check. May move OPEN -> HALF_OPEN once the cooldown has passed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    debug!(breaker = %self.name, "Circuit breaker half-open, admitting trial calls");
                    broker_metrics::record_breaker_transition(&self.name, BreakerState::HalfOpen);
                    true
                } else {
                    inner.rejected += 1;
                    broker_metrics::record_breaker_rejected(&self.name);
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.half_open_successes = 0;
                    info!(breaker = %self.name, "Circuit breaker closed");
                    broker_metrics::record_breaker_transition(&self.name, BreakerState::Closed);
                }
            }
            BreakerState::Closed => inner.failures = 0,
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.half_open_successes = 0;
                warn!(breaker = %self.name, "Trial call failed, circuit breaker reopened");
                broker_metrics::record_breaker_transition(&self.name, BreakerState::Open);
            }
            BreakerState::Closed if inner.failures >= self.config.failure_threshold => {
                inner.state = BreakerState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failures,
                    "Circuit breaker opened"
                );
                broker_metrics::record_breaker_transition(&self.name, BreakerState::Open);
            }
            _ => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            half_open_successes: inner.half_open_successes,
            rejected: inner.rejected,
        }
    }
}
