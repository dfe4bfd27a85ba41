//! Circuit breaker states and the transitions call outcomes may cause.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// A single probe call is allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding used by the metrics collector.
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    /// Whether call outcomes may move the breaker from `self` to `next`.
    ///
    /// Only `HalfOpen` closes, only `Closed` and `HalfOpen` open, and only
    /// `Open` moves to `HalfOpen` (once its recovery timeout has elapsed).
    /// Operator overrides (`reset`, `force_state`) are not bound by this.
    pub fn can_transition_to(&self, next: CircuitState) -> bool {
        matches!(
            (self, next),
            (CircuitState::HalfOpen, CircuitState::Closed)
                | (CircuitState::Closed, CircuitState::Open)
                | (CircuitState::HalfOpen, CircuitState::Open)
                | (CircuitState::Open, CircuitState::HalfOpen)
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
