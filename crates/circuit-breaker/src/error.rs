//! Circuit breaker error types.

use thiserror::Error;

/// Error returned by [`CircuitBreakerRegistry::execute`](crate::CircuitBreakerRegistry::execute).
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("Circuit breaker {name} is OPEN")]
    Open { name: String },

    /// The operation did not complete within the circuit's timeout.
    #[error("Circuit breaker {name}: operation timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// The operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The operation's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}
