use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored event.
///
/// Strictly two-state: an event moves `Pending → Processed` once and never
/// back. In-flight processing lives only in the scheduler's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for its trigger time.
    Pending,
    /// Terminal: delivered, found empty, or permanently failed.
    Processed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processed" => Ok(EventStatus::Processed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// A persisted event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Upstream-assigned id. Primary key, stable across fetches.
    pub id: String,
    pub name: String,
    /// Authoritative for all scheduling math.
    pub start_date: DateTime<Utc>,
    pub status: EventStatus,
}

impl Event {
    /// The instant at which pre-event processing should run. A lead too
    /// large to represent saturates to the earliest instant, i.e. due now.
    pub fn trigger_at(&self, lead_minutes: i64) -> DateTime<Utc> {
        chrono::Duration::try_minutes(lead_minutes)
            .and_then(|lead| self.start_date.checked_sub_signed(lead))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Candidate row for an idempotent insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub id: String,
    pub name: String,
    pub start_date: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, start_date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            start_date,
        }
    }
}

/// Render a timestamp the way it is stored: RFC 3339, UTC, whole seconds.
///
/// Fixed width and `Z` suffix, so string comparison in SQL matches
/// chronological order.
pub fn to_db_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
