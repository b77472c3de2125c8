use std::time::Duration;

use chrono::{DateTime, Utc};
use rollcall_core::types::Event;

/// Time left until `event` should be processed, measured from `now`.
///
/// Returns `None` when the trigger point (`start_date − lead_minutes`) is
/// now or already behind us; such events go to immediate processing.
pub fn trigger_delay(event: &Event, lead_minutes: i64, now: DateTime<Utc>) -> Option<Duration> {
    let delay = event.trigger_at(lead_minutes) - now;
    if delay <= chrono::Duration::zero() {
        return None;
    }
    delay.to_std().ok()
}
