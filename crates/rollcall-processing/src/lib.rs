//! `rollcall-processing`: what happens when an event's trigger point arrives.
//!
//! [`EventProcessor`] fetches the event detail and attendees, renders a
//! roster, hands it to the configured printer and mailers, and always marks
//! the event processed afterwards. Failures become dead-letter entries and a
//! best-effort webhook notification.

pub mod delivery;
pub mod document;
pub mod error;
pub mod notify;
pub mod processor;

pub use delivery::{CommandMailer, CommandPrinter, DocumentGenerator, EmailDelivery, LocalDelivery};
pub use document::RosterWriter;
pub use error::{DeliveryError, ProcessError, Result};
pub use notify::{ErrorNotifier, WebhookNotifier};
pub use processor::{EventProcessor, ProcessOutcome};
