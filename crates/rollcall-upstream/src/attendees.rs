use std::cmp::Ordering;
use std::sync::Arc;

use rollcall_resilience::{Dependency, Resilience};
use tracing::{debug, info, warn};

use crate::client::UpstreamApi;
use crate::error::{Result, UpstreamError};
use crate::types::Attendee;

/// Collects every attendee of an event, page by page.
///
/// Termination never depends on the advisory `meta` counters: the loop ends
/// on an empty page or on a page shorter than the requested size, and the
/// offset advances by the number of records actually received. `max_pages`
/// bounds the request count no matter what the upstream returns.
pub struct AttendeeFetcher {
    api: Arc<dyn UpstreamApi>,
    resilience: Arc<Resilience>,
    page_size: u32,
    max_pages: u32,
}

impl AttendeeFetcher {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        resilience: Arc<Resilience>,
        page_size: u32,
        max_pages: u32,
    ) -> Self {
        Self {
            api,
            resilience,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    /// All attendees, sorted by last name then first name.
    pub async fn fetch_all(&self, event_id: &str) -> Result<Vec<Attendee>> {
        let mut attendees = Vec::new();
        let mut offset: u64 = 0;
        let mut pages: u32 = 0;

        loop {
            if pages >= self.max_pages {
                warn!(event_id, pages, "attendee pagination cap reached");
                return Err(UpstreamError::PaginationLimit {
                    event_id: event_id.to_string(),
                    pages,
                });
            }
            pages += 1;

            let page = self
                .resilience
                .call(Dependency::Api, || {
                    self.api.attendee_page(event_id, self.page_size, offset)
                })
                .await?;

            let records = page.attendees.unwrap_or_default();
            let received = records.len() as u64;
            if let Some(meta) = &page.meta {
                if meta.count.is_some_and(|count| count != received) {
                    debug!(event_id, offset, received, count = ?meta.count, "meta.count disagrees with page size");
                }
            }
            if received == 0 {
                break;
            }

            attendees.extend(records);
            offset += received;
            if received < u64::from(self.page_size) {
                break;
            }
        }

        sort_attendees(&mut attendees);
        info!(event_id, count = attendees.len(), pages, "attendees fetched");
        Ok(attendees)
    }
}

fn sort_key(value: &Option<String>) -> String {
    value.as_deref().unwrap_or_default().to_lowercase()
}

/// Case-insensitive sort on last name, then first name. Missing names sort
/// as the empty string.
pub fn sort_attendees(attendees: &mut [Attendee]) {
    attendees.sort_by(|a, b| {
        match sort_key(&a.last_name).cmp(&sort_key(&b.last_name)) {
            Ordering::Equal => sort_key(&a.first_name).cmp(&sort_key(&b.first_name)),
            other => other,
        }
    });
}
