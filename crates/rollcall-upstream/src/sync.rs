use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rollcall_core::types::NewEvent;
use rollcall_resilience::{Dependency, Resilience};
use rollcall_store::EventStore;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::UpstreamApi;
use crate::error::Result;
use crate::filter::EventFilter;
use crate::types::UpstreamEvent;

/// Per-stage counts of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub in_window: usize,
    pub after_category: usize,
    pub after_predicate: usize,
    pub inserted: usize,
}

/// Pulls upcoming events and inserts the new ones into the store.
pub struct UpstreamSync {
    api: Arc<dyn UpstreamApi>,
    store: EventStore,
    resilience: Arc<Resilience>,
    filter: EventFilter,
}

impl UpstreamSync {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        store: EventStore,
        resilience: Arc<Resilience>,
        filter: EventFilter,
    ) -> Self {
        Self {
            api,
            store,
            resilience,
            filter,
        }
    }

    /// Sync events starting within `window` from now.
    pub async fn sync(&self, window: Duration) -> Result<SyncReport> {
        self.sync_at(Utc::now(), window).await
    }

    /// Fetch `[now, now + window]`, filter, and insert new events in one
    /// transaction. Re-running with the same upstream data inserts nothing.
    pub async fn sync_at(&self, now: DateTime<Utc>, window: Duration) -> Result<SyncReport> {
        let to = now + window;
        let payload = self
            .resilience
            .call(Dependency::Api, || self.api.list_events(now, to))
            .await?;

        let events = parse_event_list(&payload);
        let mut report = SyncReport {
            fetched: events.len(),
            ..SyncReport::default()
        };

        let in_window: Vec<UpstreamEvent> = events
            .into_iter()
            .filter(|e| e.start_date >= now && e.start_date <= to)
            .collect();
        report.in_window = in_window.len();

        let categorized: Vec<UpstreamEvent> = in_window
            .into_iter()
            .filter(|e| self.filter.category_allows(e))
            .collect();
        report.after_category = categorized.len();
        debug!(
            before = report.in_window,
            after = report.after_category,
            "category filter applied"
        );

        let candidates: Vec<NewEvent> = categorized
            .into_iter()
            .filter(|e| self.filter.predicate_allows(e))
            .map(|e| NewEvent::new(e.id, e.name, e.start_date))
            .collect();
        report.after_predicate = candidates.len();
        debug!(
            before = report.after_category,
            after = report.after_predicate,
            "keyword/fee filter applied"
        );

        report.inserted = self.store.insert_batch(&candidates)?;
        info!(
            fetched = report.fetched,
            in_window = report.in_window,
            after_category = report.after_category,
            after_predicate = report.after_predicate,
            inserted = report.inserted,
            "upstream sync complete"
        );
        Ok(report)
    }
}

/// Extract events from a listing payload.
///
/// Accepts a bare array or an object carrying an `events` or `data` array.
/// Entries that do not deserialize are skipped; any other shape yields no
/// events.
pub fn parse_event_list(payload: &Value) -> Vec<UpstreamEvent> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("events").or_else(|| obj.get("data")) {
            Some(Value::Array(items)) => items,
            _ => {
                warn!("event listing has no events array, treating as empty");
                return Vec::new();
            }
        },
        Value::Null => return Vec::new(),
        _ => {
            warn!("unexpected event listing shape, treating as empty");
            return Vec::new();
        }
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<UpstreamEvent>(item.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "skipping malformed upstream event");
                None
            }
        })
        .collect()
}
