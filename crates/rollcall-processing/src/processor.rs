use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::config::EmailConfig;
use rollcall_core::types::Event;
use rollcall_resilience::{Dependency, Resilience};
use rollcall_scheduler::EventHandler;
use rollcall_store::{DeadLetterLog, EventStore, NewDeadLetter};
use rollcall_upstream::{AttendeeFetcher, UpstreamApi, UpstreamError};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::delivery::{DocumentGenerator, EmailDelivery, LocalDelivery};
use crate::error::{DeliveryError, ProcessError};
use crate::notify::ErrorNotifier;

pub const DEAD_LETTER_KIND: &str = "event_processing";

/// Result of processing one event. The event is `processed` afterwards in
/// every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Delivered { attendees: usize },
    NoAttendees,
    Failed(String),
}

/// The fallible part of processing. Runs in its own task.
#[derive(Clone)]
struct Pipeline {
    api: Arc<dyn UpstreamApi>,
    fetcher: Arc<AttendeeFetcher>,
    resilience: Arc<Resilience>,
    documents: Arc<dyn DocumentGenerator>,
    layout: Value,
    printer: Option<Arc<dyn LocalDelivery>>,
    mailer: Option<(Arc<dyn EmailDelivery>, EmailConfig)>,
}

impl Pipeline {
    async fn run(&self, event: &Event) -> Result<ProcessOutcome, ProcessError> {
        let detail = self
            .resilience
            .call(Dependency::Api, || self.api.event_detail(&event.id))
            .await
            .map_err(|e| ProcessError::Detail(UpstreamError::from(e)))?;

        let attendees = self
            .fetcher
            .fetch_all(&event.id)
            .await
            .map_err(ProcessError::Attendees)?;
        if attendees.is_empty() {
            info!(event_id = %event.id, "no attendees, nothing to deliver");
            return Ok(ProcessOutcome::NoAttendees);
        }

        let file = self
            .documents
            .generate(&detail, &attendees, &self.layout)
            .await
            .map_err(ProcessError::Document)?;

        // Each target is attempted even when an earlier one failed.
        let mut failures = Vec::new();
        if let Some(printer) = &self.printer {
            let printed = self
                .resilience
                .call(Dependency::Printer, || printer.deliver(&file))
                .await;
            if let Err(e) = printed {
                failures.push(format!("print: {}", DeliveryError::from(e)));
            }
        }
        if let Some((mailer, cfg)) = &self.mailer {
            for recipient in &cfg.recipients {
                let sent = self
                    .resilience
                    .call(Dependency::Email, || mailer.send(&cfg.transport, recipient, &file))
                    .await;
                if let Err(e) = sent {
                    failures.push(format!("email to {recipient}: {}", DeliveryError::from(e)));
                }
            }
        }

        if failures.is_empty() {
            Ok(ProcessOutcome::Delivered {
                attendees: attendees.len(),
            })
        } else {
            Err(ProcessError::Delivery(failures))
        }
    }
}

/// Processing callback run by the scheduler for each triggered event.
///
/// Whatever happens inside (errors, open breakers, a panicking
/// collaborator), the event ends up `processed`. A failure additionally
/// produces a dead-letter entry and, when configured, a notification.
pub struct EventProcessor {
    pipeline: Arc<Pipeline>,
    store: EventStore,
    dead_letters: DeadLetterLog,
    notifier: Option<Arc<dyn ErrorNotifier>>,
}

impl EventProcessor {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        fetcher: AttendeeFetcher,
        resilience: Arc<Resilience>,
        documents: Arc<dyn DocumentGenerator>,
        layout: Value,
        store: EventStore,
        dead_letters: DeadLetterLog,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                api,
                fetcher: Arc::new(fetcher),
                resilience,
                documents,
                layout,
                printer: None,
                mailer: None,
            }),
            store,
            dead_letters,
            notifier: None,
        }
    }

    pub fn with_printer(mut self, printer: Arc<dyn LocalDelivery>) -> Self {
        Arc::make_mut(&mut self.pipeline).printer = Some(printer);
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn EmailDelivery>, cfg: EmailConfig) -> Self {
        Arc::make_mut(&mut self.pipeline).mailer = Some((mailer, cfg));
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ErrorNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub async fn process(&self, event: Event) -> ProcessOutcome {
        info!(event_id = %event.id, name = %event.name, "processing event");

        let pipeline = self.pipeline.clone();
        let task_event = event.clone();
        let outcome = match tokio::spawn(async move { pipeline.run(&task_event).await }).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ProcessOutcome::Failed(e.to_string()),
            Err(e) => ProcessOutcome::Failed(format!("processing task failed: {e}")),
        };

        if let ProcessOutcome::Failed(message) = &outcome {
            self.report_failure(&event, message).await;
        }

        if let Err(e) = self.store.mark_processed(&event.id) {
            error!(event_id = %event.id, "could not mark event processed: {e}");
        }

        match &outcome {
            ProcessOutcome::Failed(message) => {
                warn!(event_id = %event.id, error = %message, "event processing failed")
            }
            other => info!(event_id = %event.id, outcome = ?other, "event processed"),
        }
        outcome
    }

    /// Dead-letter entry plus notification. Neither may keep the event
    /// from being marked processed, so both only log their own failures.
    async fn report_failure(&self, event: &Event, message: &str) {
        let entry = NewDeadLetter {
            kind: DEAD_LETTER_KIND.to_string(),
            timestamp: Utc::now(),
            payload: json!({
                "event_id": event.id,
                "event_name": event.name,
                "start_date": event.start_date.to_rfc3339(),
            }),
            error_message: message.to_string(),
            // the callback runs once per event
            attempts: 1,
        };
        if let Err(e) = self.dead_letters.append(&entry) {
            error!(event_id = %event.id, "could not record dead letter: {e}");
        }

        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let resilience = self.pipeline.resilience.clone();
        let event = event.clone();
        let message = message.to_string();
        let sent = tokio::spawn(async move {
            resilience
                .call(Dependency::Webhook, || notifier.notify(&event, &message))
                .await
                .map_err(DeliveryError::from)
        })
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("error notification not delivered: {e}"),
            Err(e) => warn!("error notification task failed: {e}"),
        }
    }
}

#[async_trait]
impl EventHandler for EventProcessor {
    async fn handle(&self, event: Event) {
        self.process(event).await;
    }
}
