//! Circuit breaker for the deletion pipeline.
//!
//! Tracks pipeline health and holds back attempts while it is failing.
//! Three states: Closed (healthy), Open (failing), HalfOpen (probing).

use serde::Serialize;
use std::time::{Duration, Instant};

/// How long an Open circuit waits before letting a probe through.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineHealth {
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub total_failures: u64,
}

/// Circuit breaker guarding calls to the deletion pipeline.
///
/// - Closed: all attempts pass through
/// - Open: attempts wait until the recovery timeout elapses
/// - HalfOpen: attempts pass; the next outcome closes or reopens the circuit
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    health: PipelineHealth,
    threshold: u32,
    opened_at: Option<Instant>,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given failure threshold.
    pub fn new(threshold: u32) -> Self {
        Self::with_recovery_timeout(threshold, RECOVERY_TIMEOUT)
    }

    pub fn with_recovery_timeout(threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            health: PipelineHealth::default(),
            threshold: threshold.max(1),
            opened_at: None,
            recovery_timeout,
        }
    }

    /// Returns true if an attempt may proceed now. An Open circuit whose
    /// recovery timeout has elapsed moves to HalfOpen.
    pub fn should_allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.retry_after().is_none() {
                    self.state = CircuitState::HalfOpen;
                    tracing::info!("pipeline circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left before an Open circuit admits a probe.
    pub fn retry_after(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened_at = self.opened_at?;
        self.recovery_timeout
            .checked_sub(opened_at.elapsed())
            .filter(|d| !d.is_zero())
    }

    pub fn record_success(&mut self) {
        self.health.consecutive_failures = 0;
        self.health.total_attempts += 1;
        if self.state != CircuitState::Closed {
            self.state = CircuitState::Closed;
            self.opened_at = None;
            tracing::info!("pipeline circuit breaker closed");
        }
    }

    pub fn record_failure(&mut self) {
        self.health.consecutive_failures += 1;
        self.health.total_attempts += 1;
        self.health.total_failures += 1;

        match self.state {
            CircuitState::Closed => {
                if self.health.consecutive_failures >= self.threshold {
                    self.open();
                    tracing::warn!(
                        consecutive_failures = self.health.consecutive_failures,
                        "pipeline circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open();
                tracing::warn!("pipeline circuit breaker reopened after failed probe");
            }
            CircuitState::Open => self.opened_at = Some(Instant::now()),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn health(&self) -> &PipelineHealth {
        &self.health
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
    }
}
