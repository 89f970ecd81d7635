//! Slot Manager: bounds how many integration jobs run at once across all workers.
//!
//! The coordination store holds the active set, the expiry map and a cached
//! counter. Admission and release are single scripted calls; reconciliation
//! (evicting expired or half-written members, resyncing the counter) happens
//! before every retried admission and on the maintenance timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use feedsync_core::{Clock, IntegrationId, QueueStatus, to_chrono};

use crate::config::SlotConfig;
use crate::coordination::{
    CoordinationError, CoordinationStore, FinalHeartbeat, HeartbeatOutcome, SlotAdmission,
    SlotSnapshot,
};
use crate::queue_store::TenantActivity;
use crate::retry::RetryPolicy;
use crate::status::{StatusError, StatusManager};

/// Name of the cleanup mutual-exclusion lock.
const CLEANUP_LOCK: &str = "slot-cleanup";

/// Freshly admitted members are not yet in process in the durable store.
const ORPHAN_GRACE: Duration = Duration::from_secs(60);

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDenial {
    CeilingReached,
    /// The job is listed active without an expiry, even after reconciliation.
    AlreadyActive,
    /// The coordination store could not be reached; admission fails closed.
    CoordinationUnavailable,
}

impl std::fmt::Display for SlotDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SlotDenial::CeilingReached => "ceiling reached",
            SlotDenial::AlreadyActive => "already active",
            SlotDenial::CoordinationUnavailable => "coordination store unavailable",
        })
    }
}

/// Answer of [`SlotManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAcquisition {
    pub admitted: bool,
    pub reason: Option<SlotDenial>,
    /// Active members after the call, when known.
    pub active: usize,
    /// Expiry written by this admission; hand it back to
    /// [`SlotManager::release_admission`].
    pub expires_at: Option<DateTime<Utc>>,
}

impl SlotAcquisition {
    fn admitted(active: usize, expires_at: DateTime<Utc>) -> Self {
        Self {
            admitted: true,
            reason: None,
            active,
            expires_at: Some(expires_at),
        }
    }

    fn denied(reason: SlotDenial, active: usize) -> Self {
        Self {
            admitted: false,
            reason: Some(reason),
            active,
            expires_at: None,
        }
    }
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Members removed from the active set.
    pub evicted: Vec<IntegrationId>,
    /// Durable records returned to pending.
    pub reset: Vec<IntegrationId>,
    /// Stalled-looking jobs left alone because the tenant is still writing.
    pub corroborated: Vec<IntegrationId>,
    /// The cleanup lock was held elsewhere; nothing was done.
    pub skipped: bool,
}

impl CleanupReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CleanupError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

pub struct SlotManager {
    store: Arc<dyn CoordinationStore>,
    status: Arc<StatusManager>,
    activity: Arc<dyn TenantActivity>,
    clock: Arc<dyn Clock>,
    config: SlotConfig,
    retry: RetryPolicy,
    worker_id: String,
    /// Token identifying this process as cleanup-lock owner.
    lock_owner: String,
}

impl SlotManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        status: Arc<StatusManager>,
        activity: Arc<dyn TenantActivity>,
        clock: Arc<dyn Clock>,
        config: SlotConfig,
        retry: RetryPolicy,
        worker_id: &str,
    ) -> Self {
        Self {
            store,
            status,
            activity,
            clock,
            config,
            retry,
            worker_id: worker_id.to_string(),
            lock_owner: format!("{worker_id}:{}", uuid::Uuid::now_v7()),
        }
    }

    pub fn config(&self) -> &SlotConfig {
        &self.config
    }

    /// Try to admit a job. Never errors: coordination failures deny admission.
    #[instrument(skip(self), fields(integration_id = %integration_id))]
    pub async fn acquire(&self, integration_id: IntegrationId) -> SlotAcquisition {
        let first = match self.admit(integration_id).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(error = %e, "slot admission failed closed");
                return SlotAcquisition::denied(SlotDenial::CoordinationUnavailable, 0);
            }
        };
        if let SlotAdmission::Admitted { active, expires_at } = first {
            debug!(active, "slot acquired");
            return SlotAcquisition::admitted(active, expires_at);
        }

        // One fast reconciliation pass, then one more try.
        match self.reconcile(true).await {
            Ok(evicted) if !evicted.is_empty() => {
                info!(evicted = evicted.len(), "reconciliation evicted slot members");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "slot reconciliation failed"),
        }

        match self.admit(integration_id).await {
            Ok(SlotAdmission::Admitted { active, expires_at }) => {
                debug!(active, "slot acquired after reconciliation");
                SlotAcquisition::admitted(active, expires_at)
            }
            Ok(SlotAdmission::CeilingReached { active }) => {
                info!(active, max_slots = self.config.max_slots, "slot ceiling reached");
                SlotAcquisition::denied(SlotDenial::CeilingReached, active)
            }
            Ok(SlotAdmission::AlreadyActive) => {
                warn!("job still listed active without expiry");
                SlotAcquisition::denied(SlotDenial::AlreadyActive, 0)
            }
            Err(e) => {
                warn!(error = %e, "slot admission failed closed");
                SlotAcquisition::denied(SlotDenial::CoordinationUnavailable, 0)
            }
        }
    }

    /// Release a job's slot. Idempotent; falls back to plain commands when the
    /// scripted path keeps failing.
    #[instrument(skip(self), fields(integration_id = %integration_id), err)]
    pub async fn release(&self, integration_id: IntegrationId) -> Result<usize, CoordinationError> {
        let scripted = self
            .retry
            .run("release_slot", || self.store.release_slot(integration_id))
            .await;
        match scripted {
            Ok(active) => {
                debug!(active, "slot released");
                Ok(active)
            }
            Err(e) => {
                warn!(error = %e, "scripted release failed, using direct release");
                self.retry
                    .run("force_release_slot", || {
                        self.store.force_release_slot(integration_id)
                    })
                    .await
            }
        }
    }

    /// Release the slot only while it still carries the admission that wrote
    /// `expires_at`. A slot reclaimed by cleanup and taken again by a later run
    /// is left alone. Returns whether this call removed the member.
    #[instrument(skip(self), fields(integration_id = %integration_id), err)]
    pub async fn release_admission(
        &self,
        integration_id: IntegrationId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoordinationError> {
        let released = self
            .retry
            .run("release_admission", || {
                self.store.release_admission(integration_id, expires_at)
            })
            .await?;
        if released {
            debug!("slot released");
        } else {
            info!("slot no longer holds this admission, left in place");
        }
        Ok(released)
    }

    /// Live members (non-expired) right now.
    pub async fn active_count(&self) -> Result<usize, CoordinationError> {
        let now = self.clock.now();
        Ok(self.snapshot().await?.live_count(now))
    }

    pub async fn snapshot(&self) -> Result<SlotSnapshot, CoordinationError> {
        self.retry
            .run("slot_snapshot", || self.store.slot_snapshot())
            .await
    }

    /// Evict members past their deadline and return their jobs to the queue.
    #[instrument(skip(self), err)]
    pub async fn cleanup_expired(&self) -> Result<CleanupReport, CleanupError> {
        self.with_cleanup_lock(|| async {
            let evicted = self.reconcile(false).await?;
            let mut report = CleanupReport {
                evicted: evicted.clone(),
                ..Default::default()
            };

            for id in evicted {
                if self.reset_if_in_process(id, "slot expired").await {
                    report.reset.push(id);
                }
                self.drop_heartbeat(id).await;
            }

            if !report.evicted.is_empty() {
                info!(
                    evicted = report.evicted.len(),
                    reset = report.reset.len(),
                    "expired slots reclaimed"
                );
            }
            Ok::<_, CleanupError>(report)
        })
        .await
    }

    /// Evict members with no in-process durable record, then reset durable
    /// records stuck in process past the stall threshold.
    #[instrument(skip(self), err)]
    pub async fn cleanup_orphaned(&self) -> Result<CleanupReport, CleanupError> {
        self.with_cleanup_lock(|| async {
            let now = self.clock.now();
            let mut report = CleanupReport::default();

            let snapshot = self.snapshot().await?;
            let settled: Vec<IntegrationId> = snapshot
                .members
                .iter()
                .filter(|m| match m.expires_at {
                    Some(exp) => {
                        exp - to_chrono(self.config.slot_ttl) + to_chrono(ORPHAN_GRACE) <= now
                    }
                    None => true,
                })
                .map(|m| m.integration_id)
                .collect();

            let in_process = self.status.in_process_among(&settled).await?;
            for id in settled.into_iter().filter(|id| !in_process.contains(id)) {
                match self.release(id).await {
                    Ok(_) => {
                        warn!(integration_id = %id, "orphaned slot evicted");
                        report.evicted.push(id);
                        self.drop_heartbeat(id).await;
                    }
                    Err(e) => warn!(integration_id = %id, error = %e, "orphan eviction failed"),
                }
            }

            let cutoff = now - to_chrono(self.config.stall_threshold);
            let since = now - to_chrono(self.config.activity_window);
            for stalled in self.status.list_stalled(cutoff).await? {
                let id = stalled.integration_id;
                match self.activity.has_recent_writes(stalled.user_id, since).await {
                    Ok(true) => {
                        info!(integration_id = %id, "stalled job corroborated by tenant writes");
                        report.corroborated.push(id);
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(integration_id = %id, error = %e, "activity check failed, leaving job alone");
                        continue;
                    }
                }

                if self.reset_if_in_process(id, "stalled in process").await {
                    report.reset.push(id);
                }
                if let Err(e) = self.release(id).await {
                    warn!(integration_id = %id, error = %e, "slot release after stall reset failed");
                } else if !report.evicted.contains(&id) {
                    report.evicted.push(id);
                }
                self.drop_heartbeat(id).await;
            }

            Ok::<_, CleanupError>(report)
        })
        .await
    }

    async fn admit(&self, integration_id: IntegrationId) -> Result<SlotAdmission, CoordinationError> {
        let now = self.clock.now();
        self.retry
            .run("acquire_slot", || {
                self.store.acquire_slot(
                    integration_id,
                    now,
                    self.config.slot_ttl,
                    self.config.max_slots,
                )
            })
            .await
    }

    async fn reconcile(&self, evict_unbounded: bool) -> Result<Vec<IntegrationId>, CoordinationError> {
        let now = self.clock.now();
        self.retry
            .run("evict_expired_slots", || {
                self.store.evict_expired_slots(now, evict_unbounded)
            })
            .await
    }

    async fn reset_if_in_process(&self, integration_id: IntegrationId, reason: &str) -> bool {
        match self.status.load(integration_id).await {
            Ok(Some((_, entry))) if entry.status == QueueStatus::InProcess => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(integration_id = %integration_id, error = %e, "could not load entry for reset");
                return false;
            }
        }
        match self.status.reset_to_pending(integration_id, reason, None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(integration_id = %integration_id, error = %e, "reset to pending failed");
                false
            }
        }
    }

    /// Replace the live heartbeat of a reclaimed job with a `Recovered` tombstone.
    async fn drop_heartbeat(&self, integration_id: IntegrationId) {
        if let Err(e) = self.retire_heartbeat(integration_id).await {
            warn!(integration_id = %integration_id, error = %e, "heartbeat retirement failed");
        }
    }

    async fn retire_heartbeat(&self, integration_id: IntegrationId) -> Result<(), CoordinationError> {
        let live = self
            .retry
            .run("get_heartbeat", || self.store.get_heartbeat(integration_id))
            .await?;
        let tombstone = FinalHeartbeat::from_live(
            integration_id,
            live.as_ref(),
            &self.worker_id,
            HeartbeatOutcome::Recovered,
            self.clock.now(),
        );
        self.retry
            .run("put_final_heartbeat", || {
                self.store
                    .put_final_heartbeat(&tombstone, self.config.final_heartbeat_ttl)
            })
            .await?;
        self.retry
            .run("delete_heartbeat", || self.store.delete_heartbeat(integration_id))
            .await?;
        Ok(())
    }

    async fn with_cleanup_lock<F, Fut>(&self, pass: F) -> Result<CleanupReport, CleanupError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CleanupReport, CleanupError>>,
    {
        let taken = self
            .retry
            .run("try_lock", || {
                self.store
                    .try_lock(CLEANUP_LOCK, &self.lock_owner, self.config.cleanup_lock_ttl)
            })
            .await?;
        if !taken {
            debug!("cleanup lock held elsewhere, skipping pass");
            return Ok(CleanupReport::skipped());
        }

        let result = pass().await;

        if let Err(e) = self.store.unlock(CLEANUP_LOCK, &self.lock_owner).await {
            warn!(error = %e, "cleanup lock release failed; it will expire");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use crate::queue_store::{
        InMemoryQueueStore, NoTenantActivity, QueueStore, RecordedTenantActivity,
    };
    use crate::status::ProcessingOptions;
    use chrono::Utc;
    use crate::coordination::HeartbeatRecord;
    use feedsync_core::{Integration, ManualClock, QueueEntry, TransitionPolicy, UserId};

    struct Fixture {
        clock: Arc<ManualClock>,
        coord: Arc<InMemoryCoordinationStore>,
        queue: Arc<InMemoryQueueStore>,
        status: Arc<StatusManager>,
        slots: SlotManager,
    }

    fn fixture(max_slots: usize) -> Fixture {
        fixture_with_activity(max_slots, Arc::new(NoTenantActivity))
    }

    fn fixture_with_activity(max_slots: usize, activity: Arc<dyn TenantActivity>) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coord = InMemoryCoordinationStore::arc(clock.clone());
        let queue = InMemoryQueueStore::arc();
        let status = Arc::new(StatusManager::new(
            queue.clone(),
            clock.clone(),
            TransitionPolicy::Permissive,
            3,
        ));
        let config = SlotConfig {
            max_slots,
            ..SlotConfig::default()
        };
        let slots = SlotManager::new(
            coord.clone(),
            status.clone(),
            activity,
            clock.clone(),
            config,
            RetryPolicy::fixed(3, Duration::ZERO),
            "test-worker",
        );
        Fixture {
            clock,
            coord,
            queue,
            status,
            slots,
        }
    }

    async fn running_job(f: &Fixture) -> IntegrationId {
        let integration = Integration::new(UserId::new(), "https://feed", "generic", f.clock.now());
        let id = integration.id;
        f.queue
            .enqueue(&integration, &QueueEntry::new(id, 0, f.clock.now()))
            .await
            .unwrap();
        assert!(f.slots.acquire(id).await.admitted);
        f.status
            .mark_processing(id, ProcessingOptions::default())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn ceiling_denies_extra_job() {
        let f = fixture(2);
        assert!(f.slots.acquire(IntegrationId::new()).await.admitted);
        assert!(f.slots.acquire(IntegrationId::new()).await.admitted);

        let denied = f.slots.acquire(IntegrationId::new()).await;
        assert!(!denied.admitted);
        assert_eq!(denied.reason, Some(SlotDenial::CeilingReached));
        assert_eq!(denied.active, 2);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let f = fixture(6);
        let id = IntegrationId::new();
        f.slots.acquire(id).await;

        assert_eq!(f.slots.release(id).await.unwrap(), 0);
        assert_eq!(f.slots.release(id).await.unwrap(), 0);
        assert_eq!(f.slots.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn half_written_member_is_reconciled_on_acquire() {
        let f = fixture(6);
        let id = IntegrationId::new();
        f.coord.insert_unbounded_member(id);

        let acquisition = f.slots.acquire(id).await;
        assert!(acquisition.admitted);
        assert_eq!(acquisition.active, 1);
    }

    #[tokio::test]
    async fn coordination_failure_fails_closed_and_release_falls_back() {
        let f = fixture(6);
        let id = IntegrationId::new();
        assert!(f.slots.acquire(id).await.admitted);

        f.coord.set_scripts_failing(true);
        let denied = f.slots.acquire(IntegrationId::new()).await;
        assert_eq!(denied.reason, Some(SlotDenial::CoordinationUnavailable));

        assert_eq!(f.slots.release(id).await.unwrap(), 0);
        assert!(!f.slots.snapshot().await.unwrap().contains(id));
    }

    #[tokio::test]
    async fn expired_slot_is_reclaimed_and_job_reset() {
        let f = fixture(6);
        let id = running_job(&f).await;
        let started = f.clock.now();
        f.coord
            .put_heartbeat(
                &HeartbeatRecord {
                    integration_id: id,
                    worker_id: "lost-worker".to_string(),
                    started_at: started,
                    last_heartbeat: started,
                    last_renewed_at: started,
                    current_step: "download".to_string(),
                    progress: None,
                    update_count: 0,
                },
                Duration::from_secs(2 * 60 * 60),
            )
            .await
            .unwrap();
        let other = running_job(&f).await;
        f.clock.advance(Duration::from_secs(20 * 60));
        f.slots.release(other).await.unwrap();
        f.clock.advance(Duration::from_secs(11 * 60));

        let report = f.slots.cleanup_expired().await.unwrap();

        assert_eq!(report.evicted, vec![id]);
        assert_eq!(report.reset, vec![id]);
        assert_eq!(f.queue.entry(id).unwrap().status, QueueStatus::Pending);
        assert_eq!(f.slots.active_count().await.unwrap(), 0);

        assert!(f.coord.get_heartbeat(id).await.unwrap().is_none());
        let tombstone = f.coord.get_final_heartbeat(id).await.unwrap().unwrap();
        assert_eq!(tombstone.outcome, HeartbeatOutcome::Recovered);
        assert_eq!(tombstone.started_at, Some(started));
        assert_eq!(tombstone.last_step.as_deref(), Some("download"));
        assert_eq!(tombstone.stopped_at, f.clock.now());
    }

    #[tokio::test]
    async fn cleanup_is_skipped_while_lock_is_held() {
        let f = fixture(6);
        assert!(f
            .coord
            .try_lock(CLEANUP_LOCK, "someone-else", Duration::from_secs(30))
            .await
            .unwrap());

        let report = f.slots.cleanup_expired().await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn orphaned_member_and_stalled_record_are_cleaned() {
        let f = fixture(6);
        let orphan = IntegrationId::new();
        assert!(f.slots.acquire(orphan).await.admitted);
        let stalled = running_job(&f).await;
        f.slots.release(stalled).await.unwrap();

        f.clock.advance(Duration::from_secs(11 * 60));
        let report = f.slots.cleanup_orphaned().await.unwrap();

        assert!(report.evicted.contains(&orphan));
        assert_eq!(report.reset, vec![stalled]);
        assert_eq!(f.queue.entry(stalled).unwrap().status, QueueStatus::Pending);
        assert_eq!(f.slots.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tenant_writes_keep_a_stalled_job_running() {
        let activity = Arc::new(RecordedTenantActivity::new());
        let f = fixture_with_activity(6, activity.clone());
        let id = running_job(&f).await;
        let user = f.queue.integration(id).unwrap().user_id;

        f.clock.advance(Duration::from_secs(12 * 60));
        activity.record_write(user, f.clock.now() - to_chrono(Duration::from_secs(60)));

        let report = f.slots.cleanup_orphaned().await.unwrap();

        assert_eq!(report.corroborated, vec![id]);
        assert!(report.reset.is_empty());
        assert!(report.evicted.is_empty());
        assert_eq!(f.queue.entry(id).unwrap().status, QueueStatus::InProcess);
        assert!(f.slots.snapshot().await.unwrap().contains(id));
        assert_eq!(f.slots.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_admission_spares_a_later_admission() {
        let f = fixture(6);
        let id = IntegrationId::new();
        let first = f.slots.acquire(id).await.expires_at.unwrap();

        f.clock.advance(Duration::from_secs(31 * 60));
        f.slots.cleanup_expired().await.unwrap();
        let second = f.slots.acquire(id).await.expires_at.unwrap();
        assert_ne!(first, second);

        assert!(!f.slots.release_admission(id, first).await.unwrap());
        assert_eq!(f.slots.active_count().await.unwrap(), 1);
        assert!(f.slots.release_admission(id, second).await.unwrap());
        assert_eq!(f.slots.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fresh_admission_is_not_an_orphan() {
        let f = fixture(6);
        let id = IntegrationId::new();
        assert!(f.slots.acquire(id).await.admitted);

        let report = f.slots.cleanup_orphaned().await.unwrap();
        assert!(report.evicted.is_empty());
        assert!(f.slots.snapshot().await.unwrap().contains(id));
    }
}
