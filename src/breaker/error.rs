//! Errors returned by circuit-breaker-guarded calls.

use std::time::Duration;
use thiserror::Error;

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker short-circuited the call; the operation was never invoked.
    #[error("circuit breaker '{name}' is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The operation did not finish within the allotted time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True when the call was rejected without reaching the operation.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout(_))
    }

    /// The operation's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err: BreakerError<std::io::Error> = BreakerError::Open {
            name: "db".to_string(),
            retry_after: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "circuit breaker 'db' is open, retry after 5s");
        assert!(err.is_open());

        let err: BreakerError<String> = BreakerError::Operation("boom".to_string());
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.into_operation().as_deref(), Some("boom"));
    }
}
