//! `rollcall-upstream`: everything that talks to the events API.
//!
//! - [`client`]: the [`UpstreamApi`] seam and its reqwest implementation
//! - [`sync`]: fetch → filter → idempotent insert
//! - [`attendees`]: bounded pagination of an event's attendee list
//!
//! Every request made by [`sync`] and [`attendees`] goes through
//! [`rollcall_resilience::Resilience`] under the `api` dependency.

pub mod attendees;
pub mod client;
pub mod error;
pub mod filter;
pub mod sync;
pub mod types;

pub use attendees::{sort_attendees, AttendeeFetcher};
pub use client::{HttpUpstream, UpstreamApi};
pub use error::{Result, UpstreamError};
pub use filter::EventFilter;
pub use sync::{parse_event_list, SyncReport, UpstreamSync};
pub use types::{Attendee, AttendeePage, EventDetail, PageMeta, UpstreamEvent};
