use rollcall_resilience::{ResilienceError, Transient};
use thiserror::Error;

/// Failures of the document, print, email and notification collaborators.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{program}' exited with {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned {status}")]
    Webhook { status: u16 },

    #[error("delivery misconfigured: {0}")]
    Config(String),

    #[error("circuit breaker '{dependency}' is open")]
    CircuitOpen { dependency: String },

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },
}

impl Transient for DeliveryError {
    fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Command { .. } => true,
            DeliveryError::Http(e) => !e.is_builder(),
            DeliveryError::Webhook { status } => *status == 429 || *status >= 500,
            DeliveryError::CircuitOpen { .. } | DeliveryError::Timeout { .. } => true,
            DeliveryError::Io(_) | DeliveryError::Config(_) => false,
        }
    }
}

impl From<ResilienceError<DeliveryError>> for DeliveryError {
    fn from(e: ResilienceError<DeliveryError>) -> Self {
        match e {
            ResilienceError::CircuitOpen { dependency } => DeliveryError::CircuitOpen { dependency },
            ResilienceError::Timeout { ms } => DeliveryError::Timeout { ms },
            ResilienceError::Call(inner) => inner,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Why processing one event failed. Rendered into the dead-letter entry.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("event detail: {0}")]
    Detail(rollcall_upstream::UpstreamError),

    #[error("attendees: {0}")]
    Attendees(rollcall_upstream::UpstreamError),

    #[error("document: {0}")]
    Document(DeliveryError),

    #[error("delivery: {}", .0.join("; "))]
    Delivery(Vec<String>),
}
