//! `rollcall-scheduler`: in-memory timers reconciled against the event store.
//!
//! # Overview
//!
//! The store is the source of truth. Each reconciliation pass lists pending
//! events inside the horizon and, per event id:
//!
//! | Trigger time (`start − lead`) | Action                                   |
//! |-------------------------------|------------------------------------------|
//! | in the future                 | arm one timer (no-op if already armed)   |
//! | already passed                | return it as due for immediate processing |
//! | callback running              | skip                                     |
//!
//! Timers live only in memory; a restart rebuilds them from the store.

pub mod engine;
pub mod error;
pub mod schedule;

pub use engine::{EventHandler, ReconcileReport, Scheduler};
pub use error::{Result, SchedulerError};
pub use schedule::trigger_delay;
