use std::sync::Arc;
use std::time::Duration;

use rollcall_resilience::{CircuitState, Resilience};
use rollcall_scheduler::Scheduler;
use rollcall_upstream::UpstreamSync;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// What one sync-and-reconcile cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// New events stored; `None` when the sync step failed.
    pub inserted: Option<usize>,
    pub armed: usize,
    pub due: usize,
    pub processed: usize,
}

/// Sync, scheduler and resilience layer, driven one cycle at a time.
pub struct Engine {
    pub sync: UpstreamSync,
    pub scheduler: Scheduler,
    pub resilience: Arc<Resilience>,
    pub window: chrono::Duration,
}

impl Engine {
    /// One cycle: sync, reconcile, then process due events in order.
    ///
    /// A failed sync only skips this cycle's fetch; reconciliation still runs
    /// against what is already stored. A store failure during reconciliation
    /// ends the cycle early.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        match self.sync.sync(self.window).await {
            Ok(sync) => report.inserted = Some(sync.inserted),
            Err(e) => warn!("sync failed, reconciling stored events only: {e}"),
        }

        match self.scheduler.reconcile() {
            Ok(reconciled) => {
                report.armed = reconciled.armed;
                report.due = reconciled.due.len();
                report.processed = self.scheduler.run_due(reconciled.due).await;
            }
            Err(e) => error!("reconciliation aborted: {e}"),
        }

        self.log_breakers();
        info!(
            inserted = ?report.inserted,
            armed = report.armed,
            due = report.due,
            processed = report.processed,
            timers = self.scheduler.armed_count(),
            "cycle complete"
        );
        report
    }

    fn log_breakers(&self) {
        for snap in self.resilience.snapshot() {
            if snap.state != CircuitState::Closed {
                warn!(
                    dependency = %snap.name,
                    state = %snap.state,
                    consecutive_failures = snap.consecutive_failures,
                    retry_in_ms = ?snap.retry_in_ms,
                    rejections = snap.stats.rejections,
                    "circuit breaker not closed"
                );
            }
        }
    }

    /// Run cycles every `interval` until `shutdown` turns true, then stop the
    /// scheduler gracefully. A cycle in progress is always finished first.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "rollcall engine started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
            }
        }
        self.scheduler.shutdown().await;
    }
}
