//! `rollcall-store`: durable SQLite state.
//!
//! Two tables live here:
//!
//! | Table          | Purpose                                                     |
//! |----------------|-------------------------------------------------------------|
//! | `events`       | One row per upstream event; `pending → processed` only      |
//! | `dead_letters` | Append-only log of failed processing attempts, size-bounded |
//!
//! Every public operation takes the connection mutex for the duration of a
//! single statement or transaction, so calls are individually atomic and no
//! lock is ever held across an `.await`.

pub mod db;
pub mod dead_letter;
pub mod error;
pub mod events;

pub use dead_letter::{DeadLetter, DeadLetterLog, NewDeadLetter};
pub use error::{Result, StoreError};
pub use events::{EventStore, StatusCounts};
