//! Circuit breaker for the provider endpoint.
//!
//! Closed until `failure_threshold` consecutive failures land within the
//! failure window; open for `cooldown_secs`, then half-open allowing a
//! single probe. A probe success closes the circuit, a failure reopens it.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BreakerConfig;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_start: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Admission check before a provider call. While open, calls fail
    /// immediately with `LlmUnavailable`; after the cooldown one probe is
    /// admitted in half-open state.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_secs(self.config.cooldown_secs) {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!("Circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(EngineError::LlmUnavailable("circuit open".into()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(EngineError::LlmUnavailable(
                        "circuit half-open, probe in flight".into(),
                    ))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            debug!("Circuit closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("Circuit reopened: probe failed");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                let window = Duration::from_secs(self.config.failure_window_secs);
                let expired = inner
                    .window_start
                    .map(|start| start.elapsed() > window)
                    .unwrap_or(true);
                if expired {
                    inner.window_start = Some(Instant::now());
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
        }
    }
}
