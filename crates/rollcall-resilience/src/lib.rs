//! `rollcall-resilience`: retry-with-backoff and per-dependency circuit
//! breakers for every call that leaves the process.
//!
//! A call through [`Resilience::call`] is layered as
//!
//! ```text
//! breaker(dependency) ─▶ retry(policy) ─▶ timeout(per attempt) ─▶ operation
//! ```
//!
//! so one logical call is one breaker outcome, an open breaker rejects without
//! running the operation at all, and a timed-out attempt counts as a failure.

pub mod breaker;
pub mod error;
pub mod registry;
pub mod retry;

pub use breaker::{BreakerSettings, BreakerSnapshot, BreakerStats, CircuitBreaker, CircuitState};
pub use error::{ResilienceError, Transient};
pub use registry::{Dependency, Resilience};
pub use retry::{retry, RetryPolicy};
