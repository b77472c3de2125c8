use std::time::Duration;

use thiserror::Error;

/// Classifies an error as worth retrying or not.
///
/// Network failures, timeouts and rate limits are transient. Authentication
/// and validation failures are definitive and are surfaced immediately.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Server-provided wait hint (e.g. `Retry-After` on a 429).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Error returned by a guarded call: either the guard refused or timed out,
/// or the operation itself failed with `E`.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("circuit breaker '{dependency}' is open")]
    CircuitOpen { dependency: String },

    #[error("call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("{0}")]
    Call(E),
}

impl<E> ResilienceError<E> {
    /// The operation's own error, if that is what this is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Call(e) => Some(e),
            _ => None,
        }
    }

    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> ResilienceError<F> {
        match self {
            ResilienceError::CircuitOpen { dependency } => ResilienceError::CircuitOpen { dependency },
            ResilienceError::Timeout { ms } => ResilienceError::Timeout { ms },
            ResilienceError::Call(e) => ResilienceError::Call(f(e)),
        }
    }
}

impl<E: Transient> Transient for ResilienceError<E> {
    fn is_transient(&self) -> bool {
        match self {
            // callers treat a rejection like any other transient failure
            ResilienceError::CircuitOpen { .. } => true,
            ResilienceError::Timeout { .. } => true,
            ResilienceError::Call(e) => e.is_transient(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::Call(e) => e.retry_after(),
            _ => None,
        }
    }
}
