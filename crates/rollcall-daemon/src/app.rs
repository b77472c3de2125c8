use std::sync::Arc;

use rollcall_core::RollcallConfig;
use rollcall_processing::{
    CommandMailer, CommandPrinter, EventProcessor, RosterWriter, WebhookNotifier,
};
use rollcall_resilience::Resilience;
use rollcall_scheduler::Scheduler;
use rollcall_store::{db, DeadLetterLog, EventStore};
use rollcall_upstream::{AttendeeFetcher, EventFilter, HttpUpstream, UpstreamApi, UpstreamSync};
use tracing::info;

use crate::cycle::Engine;

/// Durable state. Each handle owns its own connection to the same file.
pub struct Stores {
    pub events: EventStore,
    pub dead_letters: DeadLetterLog,
}

impl Stores {
    pub fn open(config: &RollcallConfig) -> anyhow::Result<Self> {
        let path = &config.database.path;
        ensure_parent_dir(path);
        info!(path = %path, "opening SQLite database");
        Ok(Self {
            events: EventStore::new(db::open(path)?)?,
            dead_letters: DeadLetterLog::new(db::open(path)?, config.dead_letter.max_entries)?,
        })
    }
}

/// Wire the full engine from config.
pub fn build_engine(config: &RollcallConfig, stores: &Stores) -> Engine {
    let resilience = Arc::new(Resilience::from_config(&config.resilience));
    let api: Arc<dyn UpstreamApi> = Arc::new(HttpUpstream::new(&config.upstream));
    let window = chrono::Duration::hours(config.schedule.sync_window_hours);

    let sync = UpstreamSync::new(
        api.clone(),
        stores.events.clone(),
        resilience.clone(),
        EventFilter::from_config(&config.filters),
    );

    let fetcher = AttendeeFetcher::new(
        api.clone(),
        resilience.clone(),
        config.upstream.page_size,
        config.upstream.max_pages,
    );
    let mut processor = EventProcessor::new(
        api,
        fetcher,
        resilience.clone(),
        Arc::new(RosterWriter::new(&config.document.output_dir)),
        config.document.layout.clone(),
        stores.events.clone(),
        stores.dead_letters.clone(),
    );
    if let Some(print) = &config.delivery.print {
        info!(program = %print.program, "printer delivery enabled");
        processor = processor.with_printer(Arc::new(CommandPrinter::new(print)));
    }
    if let Some(email) = config.delivery.email.as_ref().filter(|e| !e.recipients.is_empty()) {
        info!(recipients = email.recipients.len(), "email delivery enabled");
        processor = processor.with_mailer(Arc::new(CommandMailer), email.clone());
    }
    if let Some(url) = config.notifications.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        processor = processor.with_notifier(Arc::new(WebhookNotifier::new(url)));
    }

    let scheduler = Scheduler::new(
        stores.events.clone(),
        Arc::new(processor),
        config.schedule.lead_minutes,
        window,
    );

    Engine {
        sync,
        scheduler,
        resilience,
        window,
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
