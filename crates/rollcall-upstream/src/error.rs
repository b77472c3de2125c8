use std::time::Duration;

use rollcall_resilience::{ResilienceError, Transient};
use rollcall_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("circuit breaker '{dependency}' is open")]
    CircuitOpen { dependency: String },

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("attendee pagination for event {event_id} stopped after {pages} pages")]
    PaginationLimit { event_id: String, pages: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Transient for UpstreamError {
    fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Http(e) => !(e.is_builder() || e.is_decode()),
            // 408 and 5xx are the server's problem; every other 4xx is ours
            UpstreamError::Api { status, .. } => *status == 408 || *status >= 500,
            UpstreamError::RateLimited { .. } => true,
            UpstreamError::CircuitOpen { .. } | UpstreamError::Timeout { .. } => true,
            UpstreamError::Parse(_)
            | UpstreamError::PaginationLimit { .. }
            | UpstreamError::Store(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimited { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

impl From<ResilienceError<UpstreamError>> for UpstreamError {
    fn from(e: ResilienceError<UpstreamError>) -> Self {
        match e {
            ResilienceError::CircuitOpen { dependency } => UpstreamError::CircuitOpen { dependency },
            ResilienceError::Timeout { ms } => UpstreamError::Timeout { ms },
            ResilienceError::Call(inner) => inner,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpstreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_status() {
        let api = |status| UpstreamError::Api {
            status,
            message: String::new(),
        };
        assert!(api(503).is_transient());
        assert!(api(408).is_transient());
        assert!(!api(401).is_transient());
        assert!(!api(422).is_transient());
        assert!(UpstreamError::RateLimited { retry_after_ms: 10 }.is_transient());
        assert!(!UpstreamError::Parse("bad".into()).is_transient());
    }

    #[test]
    fn guard_errors_unwrap_into_upstream_errors() {
        let e: UpstreamError = ResilienceError::<UpstreamError>::CircuitOpen {
            dependency: "api".into(),
        }
        .into();
        assert!(matches!(e, UpstreamError::CircuitOpen { .. }));
        assert!(e.is_transient());
    }
}
