//! Per-circuit state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Tuning for a single circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a trial.
    pub recovery_timeout: Duration,
    /// Successful trials needed to close a half-open circuit.
    pub success_threshold: u32,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(30_000),
            success_threshold: 3,
            timeout: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a circuit, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    pub name: String,
    pub state: CircuitStatus,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Admission decision for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Admitted { timeout: Duration },
    Rejected,
}

#[derive(Debug)]
pub(crate) struct Circuit {
    pub(crate) options: CircuitBreakerOptions,
    status: CircuitStatus,
    failure_count: u32,
    success_count: u32,
    /// Monotonic clock for recovery timing.
    last_failure: Option<Instant>,
    /// Wall clock of the same failure, for reporting.
    last_failure_at: Option<DateTime<Utc>>,
}

impl Circuit {
    pub(crate) fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            status: CircuitStatus::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_at: None,
        }
    }

    /// Decide whether a call may proceed, moving OPEN to HALF_OPEN once the
    /// recovery timeout has elapsed.
    pub(crate) fn admit(&mut self, name: &str) -> Admission {
        if self.status == CircuitStatus::Open {
            let recovered = self
                .last_failure
                .is_some_and(|at| at.elapsed() >= self.options.recovery_timeout);
            if !recovered {
                return Admission::Rejected;
            }
            self.status = CircuitStatus::HalfOpen;
            info!(circuit = name, "Circuit breaker transitioning to HALF_OPEN");
        }

        Admission::Admitted {
            timeout: self.options.timeout,
        }
    }

    pub(crate) fn on_success(&mut self, name: &str) {
        self.failure_count = 0;

        if self.status == CircuitStatus::HalfOpen {
            self.success_count += 1;
            if self.success_count >= self.options.success_threshold {
                self.status = CircuitStatus::Closed;
                self.success_count = 0;
                info!(circuit = name, "Circuit breaker closed after successful recovery");
            }
        }
    }

    pub(crate) fn on_failure(&mut self, name: &str) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());

        match self.status {
            CircuitStatus::HalfOpen => {
                self.status = CircuitStatus::Open;
                self.success_count = 0;
                warn!(circuit = name, "Circuit breaker opened during recovery attempt");
            }
            CircuitStatus::Closed if self.failure_count >= self.options.failure_threshold => {
                self.status = CircuitStatus::Open;
                warn!(
                    circuit = name,
                    failures = self.failure_count,
                    "Circuit breaker opened after repeated failures"
                );
            }
            _ => {}
        }
    }

    pub(crate) fn snapshot(&self, name: &str) -> CircuitState {
        CircuitState {
            name: name.to_string(),
            state: self.status,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_at: self.last_failure_at,
        }
    }
}
