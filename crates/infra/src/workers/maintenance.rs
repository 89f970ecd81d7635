use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use feedsync_core::IntegrationId;

use crate::heartbeat::HeartbeatMonitor;
use crate::slots::{CleanupReport, SlotManager};

/// Handle to control and join the background maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "maintenance task ended abnormally");
            }
        }
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: CleanupReport,
    pub orphaned: CleanupReport,
    pub recovered: Vec<IntegrationId>,
    pub heartbeats_purged: usize,
    /// Steps that failed; the pass continued with the next step.
    pub failed_steps: Vec<&'static str>,
}

/// Periodic self-healing of slot and heartbeat state.
///
/// Each pass runs expired-slot cleanup, orphan cleanup, stuck-job recovery and
/// heartbeat cleanup, in that order. A failing step is logged and never stops
/// the loop.
pub struct MaintenanceWorker {
    slots: Arc<SlotManager>,
    heartbeats: Arc<HeartbeatMonitor>,
}

impl MaintenanceWorker {
    pub fn new(slots: Arc<SlotManager>, heartbeats: Arc<HeartbeatMonitor>) -> Self {
        Self { slots, heartbeats }
    }

    /// Spawn the loop on the current tokio runtime, ticking every `interval`.
    pub fn spawn(self, interval: Duration) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "maintenance worker started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            info!("maintenance worker stopped");
        });

        MaintenanceHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Run a single pass.
    pub async fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.slots.cleanup_expired().await {
            Ok(r) => report.expired = r,
            Err(e) => {
                warn!(step = "cleanup_expired", error = %e, "maintenance step failed");
                report.failed_steps.push("cleanup_expired");
            }
        }
        match self.slots.cleanup_orphaned().await {
            Ok(r) => report.orphaned = r,
            Err(e) => {
                warn!(step = "cleanup_orphaned", error = %e, "maintenance step failed");
                report.failed_steps.push("cleanup_orphaned");
            }
        }
        match self.heartbeats.recover_stuck().await {
            Ok(ids) => report.recovered = ids,
            Err(e) => {
                warn!(step = "recover_stuck", error = %e, "maintenance step failed");
                report.failed_steps.push("recover_stuck");
            }
        }
        match self.heartbeats.cleanup_expired().await {
            Ok(n) => report.heartbeats_purged = n,
            Err(e) => {
                warn!(step = "heartbeat_cleanup", error = %e, "maintenance step failed");
                report.failed_steps.push("heartbeat_cleanup");
            }
        }

        debug!(
            expired = report.expired.evicted.len(),
            orphaned = report.orphaned.evicted.len(),
            recovered = report.recovered.len(),
            heartbeats_purged = report.heartbeats_purged,
            failed_steps = report.failed_steps.len(),
            "maintenance pass finished"
        );
        report
    }
}
