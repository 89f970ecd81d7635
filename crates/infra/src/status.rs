//! Status Manager: the only writer of queue-entry and integration lifecycle status.
//!
//! Every operation follows the same shape: pre-read the entry to learn its
//! version, then ask the store for one guarded transition. An optimistic conflict
//! restarts the whole operation (fresh read, fresh validation) a bounded number
//! of times before it is surfaced.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use feedsync_core::{
    Clock, FailureRecord, Integration, IntegrationId, QueueEntry, QueueStatus, RunStamp,
    TransitionCheck, TransitionError, TransitionPolicy,
};

use crate::queue_store::{QueueStore, QueueStoreError, StalledJob};

/// Options of [`StatusManager::mark_processing`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingOptions {
    /// Allow a finished (`Done`) entry to go straight back into processing.
    pub reprocess: bool,
}

impl ProcessingOptions {
    pub fn reprocess() -> Self {
        Self { reprocess: true }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StatusError {
    #[error("integration not found: {0}")]
    NotFound(IntegrationId),

    /// A successful run must have processed at least one item.
    #[error("refusing to complete {0}: no items processed")]
    ZeroItems(IntegrationId),

    #[error("invalid transition for {integration_id}: {source}")]
    InvalidTransition {
        integration_id: IntegrationId,
        #[source]
        source: TransitionError,
    },

    /// The entry was reset or re-admitted since the run being recorded began.
    #[error("run of {0} was superseded; result discarded")]
    StaleRun(IntegrationId),

    #[error("optimistic conflict on {integration_id} persisted after {attempts} attempts")]
    Conflict {
        integration_id: IntegrationId,
        attempts: u32,
    },

    #[error("queue row vanished for {0}")]
    RowVanished(IntegrationId),

    #[error(transparent)]
    Store(QueueStoreError),
}

impl StatusError {
    fn from_store(integration_id: IntegrationId, err: QueueStoreError) -> Self {
        match err {
            QueueStoreError::NotFound(_) => StatusError::NotFound(integration_id),
            QueueStoreError::RowVanished(_) => StatusError::RowVanished(integration_id),
            QueueStoreError::Transition(TransitionError::ZeroItems) => {
                StatusError::ZeroItems(integration_id)
            }
            QueueStoreError::Transition(TransitionError::StaleRun) => {
                StatusError::StaleRun(integration_id)
            }
            QueueStoreError::Transition(source) => StatusError::InvalidTransition {
                integration_id,
                source,
            },
            other => StatusError::Store(other),
        }
    }
}

pub struct StatusManager {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    policy: TransitionPolicy,
    /// Total attempts of one operation when the version guard trips.
    conflict_attempts: u32,
}

impl StatusManager {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        policy: TransitionPolicy,
        conflict_attempts: u32,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            conflict_attempts: conflict_attempts.max(1),
        }
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// Read-only view of both rows.
    pub async fn load(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<(Integration, QueueEntry)>, StatusError> {
        self.store
            .load(integration_id)
            .await
            .map_err(|e| StatusError::from_store(integration_id, e))
    }

    /// The subset of `ids` whose entry is in process.
    pub async fn in_process_among(
        &self,
        ids: &[IntegrationId],
    ) -> Result<Vec<IntegrationId>, StatusError> {
        self.store
            .in_process_among(ids)
            .await
            .map_err(StatusError::Store)
    }

    pub async fn list_stalled(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<StalledJob>, StatusError> {
        self.store
            .list_stalled(started_before)
            .await
            .map_err(StatusError::Store)
    }

    /// Put an `Error` entry back to `Pending` for its next automatic run.
    ///
    /// The failed run was charged when it started, so attempts stay as they are.
    pub async fn requeue(&self, integration_id: IntegrationId) -> Result<QueueEntry, StatusError> {
        let policy = self.policy;
        let entry = self
            .guarded("requeue", integration_id, |_, entry, _| {
                check(policy, entry, QueueStatus::Pending, false)?;
                entry.requeue();
                Ok(())
            })
            .await?;

        debug!(integration_id = %integration_id, attempt = entry.attempts, "entry requeued");
        Ok(entry)
    }

    /// Enter `InProcess` with a clean execution record and one more attempt.
    pub async fn mark_processing(
        &self,
        integration_id: IntegrationId,
        options: ProcessingOptions,
    ) -> Result<QueueEntry, StatusError> {
        let policy = self.policy;
        let entry = self
            .guarded("mark_processing", integration_id, |integration, entry, now| {
                check(policy, entry, QueueStatus::InProcess, options.reprocess)?;
                integration.enter_processing(now);
                entry.begin_run(now);
                Ok(())
            })
            .await?;

        debug!(integration_id = %integration_id, attempt = entry.attempts, "entry marked in process");
        Ok(entry)
    }

    /// Record a successful run. Zero items is refused without touching the rows.
    ///
    /// With `run` set, the write is refused with [`StatusError::StaleRun`] unless
    /// the entry is still in process for that run. The same holds for
    /// [`mark_error`](Self::mark_error) and [`mark_failed`](Self::mark_failed).
    pub async fn mark_completed(
        &self,
        integration_id: IntegrationId,
        run: Option<RunStamp>,
        processed_items: u64,
        duration: Duration,
    ) -> Result<QueueEntry, StatusError> {
        if processed_items == 0 {
            return Err(StatusError::ZeroItems(integration_id));
        }

        let policy = self.policy;
        let duration_ms = duration.as_millis() as u64;
        let entry = self
            .guarded("mark_completed", integration_id, |integration, entry, now| {
                if let Some(run) = run {
                    entry.ensure_run(run)?;
                }
                check(policy, entry, QueueStatus::Done, false)?;
                entry.complete(processed_items, duration_ms, now)?;
                integration.record_success(processed_items, now);
                Ok(())
            })
            .await?;

        info!(
            integration_id = %integration_id,
            processed_items,
            elapsed_ms = duration_ms,
            "integration completed"
        );
        Ok(entry)
    }

    /// Record a retryable failure.
    pub async fn mark_error(
        &self,
        integration_id: IntegrationId,
        run: Option<RunStamp>,
        failure: FailureRecord,
        attempt: u32,
        duration: Duration,
    ) -> Result<QueueEntry, StatusError> {
        self.record_failure(integration_id, run, QueueStatus::Error, failure, attempt, duration)
            .await
    }

    /// Record a terminal failure. The entry is never retried automatically.
    pub async fn mark_failed(
        &self,
        integration_id: IntegrationId,
        run: Option<RunStamp>,
        failure: FailureRecord,
        attempt: u32,
        duration: Duration,
    ) -> Result<QueueEntry, StatusError> {
        self.record_failure(integration_id, run, QueueStatus::Failed, failure, attempt, duration)
            .await
    }

    /// Return an entry to `Pending` from any state (recovery path).
    pub async fn reset_to_pending(
        &self,
        integration_id: IntegrationId,
        reason: &str,
        step: Option<&str>,
    ) -> Result<QueueEntry, StatusError> {
        let entry = self
            .guarded("reset_to_pending", integration_id, |integration, entry, now| {
                entry.reset_pending(reason, step.map(str::to_string), now);
                integration.revert_idle(now);
                Ok(())
            })
            .await?;

        info!(
            integration_id = %integration_id,
            attempt = entry.attempts,
            reason,
            "entry reset to pending"
        );
        Ok(entry)
    }

    async fn record_failure(
        &self,
        integration_id: IntegrationId,
        run: Option<RunStamp>,
        status: QueueStatus,
        failure: FailureRecord,
        attempt: u32,
        duration: Duration,
    ) -> Result<QueueEntry, StatusError> {
        let policy = self.policy;
        let duration_ms = duration.as_millis() as u64;
        let op = if status == QueueStatus::Failed {
            "mark_failed"
        } else {
            "mark_error"
        };

        let entry = self
            .guarded(op, integration_id, |integration, entry, now| {
                if let Some(run) = run {
                    entry.ensure_run(run)?;
                }
                check(policy, entry, status, false)?;
                entry.fail(status, failure.clone(), attempt, duration_ms, now);
                integration.record_failure(now);
                Ok(())
            })
            .await?;

        warn!(
            integration_id = %integration_id,
            status = %status,
            attempt,
            elapsed_ms = duration_ms,
            step = entry.last_error_step.as_deref().unwrap_or(""),
            error = entry.error_message.as_deref().unwrap_or(""),
            "integration run failed"
        );
        Ok(entry)
    }

    async fn guarded<F>(
        &self,
        op: &'static str,
        integration_id: IntegrationId,
        mutate: F,
    ) -> Result<QueueEntry, StatusError>
    where
        F: Fn(&mut Integration, &mut QueueEntry, DateTime<Utc>) -> Result<(), TransitionError>
            + Send
            + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let (_, observed) = self
                .load(integration_id)
                .await?
                .ok_or(StatusError::NotFound(integration_id))?;

            let now = self.clock.now();
            let apply = |integration: &mut Integration, entry: &mut QueueEntry| {
                mutate(integration, entry, now)
            };

            match self
                .store
                .transition(integration_id, Some(observed.updated_at), now, &apply)
                .await
            {
                Ok((_, entry)) => return Ok(entry),
                Err(QueueStoreError::Conflict { .. }) if attempt < self.conflict_attempts => {
                    warn!(
                        integration_id = %integration_id,
                        operation = op,
                        attempt,
                        "optimistic conflict, retrying status update"
                    );
                }
                Err(QueueStoreError::Conflict { .. }) => {
                    return Err(StatusError::Conflict {
                        integration_id,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(StatusError::from_store(integration_id, e)),
            }
        }
    }
}

/// Validate `entry.status -> next` under `policy`, logging tolerated transitions.
fn check(
    policy: TransitionPolicy,
    entry: &QueueEntry,
    next: QueueStatus,
    reprocess: bool,
) -> Result<(), TransitionError> {
    match entry.status.check_transition(next, policy, reprocess)? {
        TransitionCheck::Legal => {}
        TransitionCheck::Tolerated => warn!(
            integration_id = %entry.integration_id,
            from = %entry.status,
            to = %next,
            "invalid status transition applied (permissive policy)"
        ),
    }
    Ok(())
}
