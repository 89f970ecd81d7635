//! Heartbeat Monitor: liveness records of running jobs.
//!
//! A running job refreshes its record through a [`ProgressReporter`]. A record
//! whose `last_heartbeat` is older than the stuck threshold marks the job as
//! stuck; recovery resets it unless the tenant's own writes show it is alive.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use feedsync_core::{Clock, IntegrationId, QueueStatus, to_chrono};

use crate::config::HeartbeatConfig;
use crate::coordination::{
    CoordinationError, CoordinationStore, FinalHeartbeat, HeartbeatOutcome, HeartbeatRecord,
    HeartbeatTouch,
};
use crate::queue_store::TenantActivity;
use crate::retry::RetryPolicy;
use crate::slots::SlotManager;
use crate::status::StatusManager;

/// A job whose heartbeat has gone silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckJob {
    pub integration_id: IntegrationId,
    pub worker_id: String,
    pub current_step: String,
    pub last_heartbeat: DateTime<Utc>,
    pub silent_for: Duration,
}

pub struct HeartbeatMonitor {
    store: Arc<dyn CoordinationStore>,
    slots: Arc<SlotManager>,
    status: Arc<StatusManager>,
    activity: Arc<dyn TenantActivity>,
    clock: Arc<dyn Clock>,
    config: HeartbeatConfig,
    retry: RetryPolicy,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        slots: Arc<SlotManager>,
        status: Arc<StatusManager>,
        activity: Arc<dyn TenantActivity>,
        clock: Arc<dyn Clock>,
        config: HeartbeatConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            slots,
            status,
            activity,
            clock,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Write a fresh record for a job that is about to run.
    #[instrument(skip(self), fields(integration_id = %integration_id), err)]
    pub async fn start(&self, integration_id: IntegrationId) -> Result<(), CoordinationError> {
        let record = self.fresh_record(integration_id, "starting", None, 0);
        self.retry
            .run("put_heartbeat", || {
                self.store.put_heartbeat(&record, self.config.max_lifetime)
            })
            .await
    }

    /// Merge progress into the live record. The TTL is extended at most once per
    /// renewal interval; a missing record is recreated.
    pub async fn update(
        &self,
        integration_id: IntegrationId,
        step: &str,
        progress: Option<u8>,
    ) -> Result<(), CoordinationError> {
        let now = self.clock.now();
        let current = self
            .retry
            .run("get_heartbeat", || self.store.get_heartbeat(integration_id))
            .await?;

        if let Some(current) = current {
            let renew = now - current.last_renewed_at >= to_chrono(self.config.renew_interval);
            let touch = HeartbeatTouch {
                step: step.to_string(),
                progress: progress.map(|p| p.min(100)),
                at: now,
                extend_ttl: renew.then_some(self.config.max_lifetime),
            };
            let touched = self
                .retry
                .run("touch_heartbeat", || {
                    self.store.touch_heartbeat(integration_id, &touch)
                })
                .await?;
            if let Some(record) = touched {
                debug!(
                    integration_id = %integration_id,
                    step,
                    update_count = record.update_count,
                    renewed = renew,
                    "heartbeat updated"
                );
                return Ok(());
            }
        }

        warn!(integration_id = %integration_id, step, "heartbeat record missing, recreating");
        let record = self.fresh_record(integration_id, step, progress, 1);
        self.retry
            .run("put_heartbeat", || {
                self.store.put_heartbeat(&record, self.config.max_lifetime)
            })
            .await
    }

    /// Replace the live record with a short-lived tombstone.
    #[instrument(skip(self), fields(integration_id = %integration_id), err)]
    pub async fn stop(
        &self,
        integration_id: IntegrationId,
        outcome: HeartbeatOutcome,
    ) -> Result<(), CoordinationError> {
        let live = self
            .retry
            .run("get_heartbeat", || self.store.get_heartbeat(integration_id))
            .await?;

        let tombstone = FinalHeartbeat::from_live(
            integration_id,
            live.as_ref(),
            &self.config.worker_id,
            outcome,
            self.clock.now(),
        );
        self.retry
            .run("put_final_heartbeat", || {
                self.store.put_final_heartbeat(&tombstone, self.config.final_ttl)
            })
            .await?;
        self.retry
            .run("delete_heartbeat", || self.store.delete_heartbeat(integration_id))
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<HeartbeatRecord>, CoordinationError> {
        self.store.get_heartbeat(integration_id).await
    }

    pub async fn final_status(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<FinalHeartbeat>, CoordinationError> {
        self.store.get_final_heartbeat(integration_id).await
    }

    pub async fn list_active(&self) -> Result<Vec<HeartbeatRecord>, CoordinationError> {
        let listing = self
            .retry
            .run("list_heartbeats", || self.store.list_heartbeats())
            .await?;
        Ok(listing.records)
    }

    /// Records silent for at least the stuck threshold.
    pub async fn list_stuck(&self) -> Result<Vec<StuckJob>, CoordinationError> {
        let now = self.clock.now();
        let threshold = to_chrono(self.config.stuck_threshold);

        Ok(self
            .list_active()
            .await?
            .into_iter()
            .filter(|r| now - r.last_heartbeat >= threshold)
            .map(|r| StuckJob {
                silent_for: (now - r.last_heartbeat).to_std().unwrap_or_default(),
                integration_id: r.integration_id,
                worker_id: r.worker_id,
                current_step: r.current_step,
                last_heartbeat: r.last_heartbeat,
            })
            .collect())
    }

    /// Reset stuck jobs that the tenant's write activity does not vouch for.
    /// Returns the ids that were recovered.
    #[instrument(skip(self), err)]
    pub async fn recover_stuck(&self) -> Result<Vec<IntegrationId>, CoordinationError> {
        let stuck = self.list_stuck().await?;
        let since = self.clock.now() - to_chrono(self.config.activity_window);
        let mut recovered = Vec::new();

        for job in stuck {
            let id = job.integration_id;
            let rows = match self.status.load(id).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(integration_id = %id, error = %e, "could not load stuck job");
                    continue;
                }
            };

            if let Some((integration, entry)) = &rows {
                match self.activity.has_recent_writes(integration.user_id, since).await {
                    Ok(true) => {
                        info!(
                            integration_id = %id,
                            silent_secs = job.silent_for.as_secs(),
                            "stuck heartbeat corroborated by tenant writes"
                        );
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(integration_id = %id, error = %e, "activity check failed, leaving job alone");
                        continue;
                    }
                }

                if entry.status == QueueStatus::InProcess {
                    let reason = format!(
                        "heartbeat silent for {}s (worker {})",
                        job.silent_for.as_secs(),
                        job.worker_id
                    );
                    if let Err(e) = self
                        .status
                        .reset_to_pending(id, &reason, Some(job.current_step.as_str()))
                        .await
                    {
                        warn!(integration_id = %id, error = %e, "stuck job reset failed");
                        continue;
                    }
                }
            }

            if let Err(e) = self.slots.release(id).await {
                warn!(integration_id = %id, error = %e, "slot release for stuck job failed");
            }
            if let Err(e) = self.stop(id, HeartbeatOutcome::Recovered).await {
                warn!(integration_id = %id, error = %e, "heartbeat removal for stuck job failed");
            }

            warn!(
                integration_id = %id,
                step = %job.current_step,
                silent_secs = job.silent_for.as_secs(),
                "stuck job recovered"
            );
            recovered.push(id);
        }

        Ok(recovered)
    }

    /// Purge records older than the max lifetime and records that cannot be decoded.
    /// Returns the number of removed records.
    #[instrument(skip(self), err)]
    pub async fn cleanup_expired(&self) -> Result<usize, CoordinationError> {
        let now = self.clock.now();
        let max_age = to_chrono(self.config.max_lifetime);
        let listing = self
            .retry
            .run("list_heartbeats", || self.store.list_heartbeats())
            .await?;

        let mut removed = 0;
        for record in listing.records {
            if now - record.started_at > max_age
                && self.store.delete_heartbeat(record.integration_id).await?
            {
                removed += 1;
            }
        }
        for key in listing.malformed_keys {
            self.store.purge_heartbeat_key(&key).await?;
            warn!(key = %key, "malformed heartbeat purged");
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "heartbeat records cleaned up");
        }
        Ok(removed)
    }

    fn fresh_record(
        &self,
        integration_id: IntegrationId,
        step: &str,
        progress: Option<u8>,
        update_count: u64,
    ) -> HeartbeatRecord {
        let now = self.clock.now();
        HeartbeatRecord {
            integration_id,
            worker_id: self.config.worker_id.clone(),
            started_at: now,
            last_heartbeat: now,
            last_renewed_at: now,
            current_step: step.to_string(),
            progress: progress.map(|p| p.min(100)),
            update_count,
        }
    }
}

/// Handle given to the processing collaborator for reporting progress.
///
/// Reporting never fails the job: store errors are logged and swallowed.
#[derive(Clone)]
pub struct ProgressReporter {
    monitor: Arc<HeartbeatMonitor>,
    integration_id: IntegrationId,
}

impl ProgressReporter {
    pub fn new(monitor: Arc<HeartbeatMonitor>, integration_id: IntegrationId) -> Self {
        Self {
            monitor,
            integration_id,
        }
    }

    pub fn integration_id(&self) -> IntegrationId {
        self.integration_id
    }

    pub async fn update(&self, step: &str, progress: Option<u8>) {
        if let Err(e) = self.monitor.update(self.integration_id, step, progress).await {
            warn!(
                integration_id = %self.integration_id,
                step,
                error = %e,
                "heartbeat update failed"
            );
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("integration_id", &self.integration_id)
            .finish()
    }
}
