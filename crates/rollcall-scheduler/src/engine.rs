use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::types::{Event, EventStatus};
use rollcall_store::EventStore;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{error::Result, schedule::trigger_delay};

/// Work to run when an event reaches its trigger point.
///
/// Called at most once per event by this scheduler; implementations are
/// expected to move the event out of `pending` themselves.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Pending events inside the horizon.
    pub pending: usize,
    /// Timers armed by this pass.
    pub armed: usize,
    /// Events whose timer was already armed; left untouched.
    pub already_armed: usize,
    /// Events whose callback is currently running; left untouched.
    pub in_flight: usize,
    /// Events past their trigger point, for [`Scheduler::run_due`].
    pub due: Vec<Event>,
}

#[derive(Default)]
struct TimerState {
    armed: HashMap<String, AbortHandle>,
    in_flight: HashSet<String>,
    shutting_down: bool,
}

/// Owns the in-memory timers. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    store: EventStore,
    handler: Arc<dyn EventHandler>,
    lead_minutes: i64,
    horizon: chrono::Duration,
    state: Arc<Mutex<TimerState>>,
    tracker: TaskTracker,
}

impl Scheduler {
    /// `horizon` bounds how far ahead pending events are considered; it is
    /// normally the sync window.
    pub fn new(
        store: EventStore,
        handler: Arc<dyn EventHandler>,
        lead_minutes: i64,
        horizon: chrono::Duration,
    ) -> Self {
        Self {
            store,
            handler,
            lead_minutes,
            horizon,
            state: Arc::new(Mutex::new(TimerState::default())),
            tracker: TaskTracker::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn armed_count(&self) -> usize {
        self.lock().armed.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_armed(&self, event_id: &str) -> bool {
        self.lock().armed.contains_key(event_id)
    }

    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconcile_at(Utc::now())
    }

    /// Arm a timer for every pending event whose trigger point is after
    /// `now`; return the rest as due.
    ///
    /// Safe to run repeatedly and concurrently with firing timers: the
    /// armed check, the reservation and the arming of one id happen under a
    /// single lock, so an id is never armed twice.
    pub fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let pending = self.store.list_pending(now + self.horizon)?;
        let mut report = ReconcileReport {
            pending: pending.len(),
            ..ReconcileReport::default()
        };

        for event in pending {
            let mut state = self.lock();
            if state.shutting_down {
                break;
            }
            if state.in_flight.contains(&event.id) {
                report.in_flight += 1;
                continue;
            }
            if state.armed.contains_key(&event.id) {
                report.already_armed += 1;
                continue;
            }

            match trigger_delay(&event, self.lead_minutes, now) {
                None => report.due.push(event),
                Some(delay) => {
                    let id = event.id.clone();
                    let handle = self.tracker.spawn(self.clone().fire_after(id.clone(), delay));
                    debug!(event_id = %id, delay_secs = delay.as_secs(), "timer armed");
                    state.armed.insert(id, handle.abort_handle());
                    report.armed += 1;
                }
            }
        }

        info!(
            pending = report.pending,
            armed = report.armed,
            already_armed = report.already_armed,
            in_flight = report.in_flight,
            due = report.due.len(),
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Process due events one after another. Returns how many callbacks ran.
    pub async fn run_due(&self, due: Vec<Event>) -> usize {
        let mut ran = 0;
        for event in due {
            {
                let mut state = self.lock();
                if state.armed.contains_key(&event.id) || !state.in_flight.insert(event.id.clone()) {
                    debug!(event_id = %event.id, "already scheduled or running, skipping");
                    continue;
                }
            }
            info!(event_id = %event.id, "processing due event immediately");
            if self.run_claimed(&event.id).await {
                ran += 1;
            }
        }
        ran
    }

    async fn fire_after(self, event_id: String, delay: Duration) {
        tokio::time::sleep(delay).await;
        {
            let mut state = self.lock();
            // Gone means shutdown cleared it.
            if state.armed.remove(&event_id).is_none() {
                return;
            }
            state.in_flight.insert(event_id.clone());
        }
        info!(event_id = %event_id, "timer fired");
        self.run_claimed(&event_id).await;
    }

    /// Re-read the event and hand it to the handler if it is still pending.
    /// The caller must already have put `event_id` in `in_flight`.
    async fn run_claimed(&self, event_id: &str) -> bool {
        let _claim = InFlight {
            state: &self.state,
            event_id,
        };
        match self.store.get(event_id) {
            Ok(Some(event)) if event.status == EventStatus::Pending => {
                self.handler.handle(event).await;
                true
            }
            Ok(Some(_)) => {
                debug!(event_id, "event no longer pending, skipping");
                false
            }
            Ok(None) => {
                warn!(event_id, "event vanished from store");
                false
            }
            Err(e) => {
                error!(event_id, "could not reload event: {e}");
                false
            }
        }
    }

    /// Clear every armed timer, then wait for running callbacks to finish.
    ///
    /// Timers that already fired are not interrupted. After shutdown the
    /// scheduler arms nothing new.
    pub async fn shutdown(&self) {
        let cleared = {
            let mut state = self.lock();
            state.shutting_down = true;
            let handles: Vec<_> = state.armed.drain().map(|(_, h)| h).collect();
            for handle in &handles {
                handle.abort();
            }
            handles.len()
        };
        info!(cleared, "armed timers cleared");

        self.tracker.close();
        let running = self.in_flight_count();
        if running > 0 {
            info!(running, "waiting for in-flight callbacks");
        }
        self.tracker.wait().await;
        info!("scheduler stopped");
    }
}

/// Releases an in-flight claim on drop, including when the handler panics.
struct InFlight<'a> {
    state: &'a Mutex<TimerState>,
    event_id: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .remove(self.event_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::types::NewEvent;
    use rusqlite::Connection;

    struct Recorder {
        store: EventStore,
        seen: Mutex<Vec<String>>,
        work: Duration,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: Event) {
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.seen.lock().unwrap().push(event.id.clone());
            self.store.mark_processed(&event.id).unwrap();
        }
    }

    fn setup(lead_minutes: i64, work: Duration) -> (Scheduler, EventStore, Arc<Recorder>) {
        let store = EventStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let recorder = Arc::new(Recorder {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
            work,
        });
        let scheduler = Scheduler::new(
            store.clone(),
            recorder.clone(),
            lead_minutes,
            chrono::Duration::hours(24),
        );
        (scheduler, store, recorder)
    }

    fn add(store: &EventStore, id: &str, start: DateTime<Utc>) {
        store
            .insert_if_absent(&NewEvent::new(id, format!("Event {id}"), start))
            .unwrap();
    }

    fn seen(recorder: &Recorder) -> Vec<String> {
        recorder.seen.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn reconciling_twice_arms_one_timer() {
        let (scheduler, store, _) = setup(30, Duration::ZERO);
        let now = Utc::now();
        add(&store, "e1", now + chrono::Duration::hours(2));

        let first = scheduler.reconcile_at(now).unwrap();
        let second = scheduler.reconcile_at(now).unwrap();
        assert_eq!(first.armed, 1);
        assert_eq!(second.armed, 0);
        assert_eq!(second.already_armed, 1);
        assert_eq!(scheduler.armed_count(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn event_inside_lead_window_is_processed_immediately() {
        let (scheduler, store, recorder) = setup(5, Duration::ZERO);
        let now = Utc::now();
        add(&store, "soon", now + chrono::Duration::minutes(4));

        let report = scheduler.reconcile_at(now).unwrap();
        assert_eq!(report.armed, 0);
        assert!(!scheduler.is_armed("soon"));
        assert_eq!(report.due.len(), 1);
        assert_eq!(store.get("soon").unwrap().unwrap().status, EventStatus::Pending);

        assert_eq!(scheduler.run_due(report.due).await, 1);
        assert_eq!(seen(&recorder), vec!["soon"]);
        assert_eq!(store.get("soon").unwrap().unwrap().status, EventStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_processes_exactly_once() {
        let (scheduler, store, recorder) = setup(30, Duration::ZERO);
        let now = Utc::now();
        add(&store, "e1", now + chrono::Duration::minutes(31));

        scheduler.reconcile_at(now).unwrap();
        scheduler.reconcile_at(now).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(scheduler.armed_count(), 0);
        assert_eq!(seen(&recorder), vec!["e1"]);

        // processed now, so nothing comes back
        let report = scheduler.reconcile_at(Utc::now()).unwrap();
        assert_eq!(report.pending, 0);
        assert_eq!(scheduler.armed_count(), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_skips_event_processed_meanwhile() {
        let (scheduler, store, recorder) = setup(0, Duration::ZERO);
        let now = Utc::now();
        add(&store, "e1", now + chrono::Duration::minutes(10));

        scheduler.reconcile_at(now).unwrap();
        store.mark_processed("e1").unwrap();
        tokio::time::sleep(Duration::from_secs(11 * 60)).await;

        assert!(seen(&recorder).is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn running_callback_is_not_scheduled_again() {
        let (scheduler, store, recorder) = setup(30, Duration::from_secs(600));
        let now = Utc::now();
        add(&store, "slow", now);

        let report = scheduler.reconcile_at(now).unwrap();
        let worker = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_due(report.due).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(scheduler.in_flight_count(), 1);

        let again = scheduler.reconcile_at(now).unwrap();
        assert_eq!(again.in_flight, 1);
        assert!(again.due.is_empty());

        assert_eq!(worker.await.unwrap(), 1);
        assert_eq!(seen(&recorder), vec!["slow"]);
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_clears_armed_timers() {
        let (scheduler, store, recorder) = setup(0, Duration::ZERO);
        let now = Utc::now();
        add(&store, "a", now + chrono::Duration::hours(1));
        add(&store, "b", now + chrono::Duration::hours(2));

        assert_eq!(scheduler.reconcile_at(now).unwrap().armed, 2);
        scheduler.shutdown().await;
        assert_eq!(scheduler.armed_count(), 0);

        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        assert!(seen(&recorder).is_empty());
        assert_eq!(store.count_by_status().unwrap().pending, 2);

        // nothing new is armed once stopped
        assert_eq!(scheduler.reconcile_at(now).unwrap().armed, 0);
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_running_callback() {
        let (scheduler, store, recorder) = setup(0, Duration::from_secs(30));
        let now = Utc::now();
        add(&store, "e1", now + chrono::Duration::seconds(5));

        scheduler.reconcile_at(now).unwrap();
        // fire the timer and let the callback start its work
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(scheduler.in_flight_count(), 1);

        scheduler.shutdown().await;
        assert_eq!(seen(&recorder), vec!["e1"]);
        assert_eq!(store.get("e1").unwrap().unwrap().status, EventStatus::Processed);
    }
}
