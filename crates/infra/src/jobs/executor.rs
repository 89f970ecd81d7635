//! Job orchestrator: runs one integration job end to end.
//!
//! Sequence per call:
//! 1. acquire a slot (denied → `RetryLater`, nothing else touched)
//! 2. load the integration (missing → `NotFound`); an `Error` entry is requeued
//! 3. mark the entry in process, start the heartbeat
//! 4. run the processor in its own task (a panic becomes a transient failure)
//! 5. record the outcome for this run only, release the lease
//!
//! If cleanup reclaimed the job while it ran, step 5 writes nothing and the
//! call returns `Superseded`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use feedsync_core::{Clock, Integration, IntegrationId, QueueEntry, QueueStatus};
use feedsync_observability::{Alert, AlertSeverity, OperatorNotifier, is_business_critical};

use crate::config::OrchestratorConfig;
use crate::coordination::HeartbeatOutcome;
use crate::heartbeat::{HeartbeatMonitor, ProgressReporter};
use crate::slots::SlotManager;
use crate::status::{ProcessingOptions, StatusError, StatusManager};

use super::lease::SlotLease;
use super::types::{ExecutionContext, FailureReport, JobOutcome, ProcessingResult};

/// The collaborator that actually fetches and ingests a feed.
#[async_trait]
pub trait FeedProcessor: Send + Sync {
    async fn process(&self, integration: &Integration, progress: ProgressReporter)
    -> ProcessingResult;
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The durable status could not be written; the job's state is whatever the
    /// store last committed.
    #[error("status update failed: {0}")]
    Status(#[from] StatusError),
}

pub struct JobOrchestrator {
    slots: Arc<SlotManager>,
    status: Arc<StatusManager>,
    heartbeats: Arc<HeartbeatMonitor>,
    processor: Arc<dyn FeedProcessor>,
    notifier: Arc<dyn OperatorNotifier>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl JobOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &OrchestratorConfig,
        slots: Arc<SlotManager>,
        status: Arc<StatusManager>,
        heartbeats: Arc<HeartbeatMonitor>,
        processor: Arc<dyn FeedProcessor>,
        notifier: Arc<dyn OperatorNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            slots,
            status,
            heartbeats,
            processor,
            notifier,
            clock,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
        }
    }

    #[instrument(
        skip(self, context),
        fields(integration_id = %integration_id, trigger = context.trigger.as_deref().unwrap_or("queue"))
    )]
    pub async fn execute(
        &self,
        integration_id: IntegrationId,
        context: ExecutionContext,
    ) -> Result<JobOutcome, OrchestratorError> {
        let acquisition = self.slots.acquire(integration_id).await;
        if !acquisition.admitted {
            let reason = acquisition
                .reason
                .unwrap_or(crate::slots::SlotDenial::CoordinationUnavailable);
            info!(reason = %reason, active = acquisition.active, "admission denied");
            return Ok(JobOutcome::RetryLater {
                reason,
                delay: self.retry_delay,
            });
        }
        let lease = SlotLease::new(
            integration_id,
            acquisition.expires_at,
            self.slots.clone(),
            self.heartbeats.clone(),
        );

        let (integration, queued) = match self.status.load(integration_id).await {
            Ok(Some(rows)) => rows,
            Ok(None) => {
                warn!("integration not found");
                lease.release(HeartbeatOutcome::Abandoned).await;
                return Ok(JobOutcome::NotFound);
            }
            Err(e) => {
                lease.release(HeartbeatOutcome::Abandoned).await;
                return Err(e.into());
            }
        };

        if queued.status == QueueStatus::Error {
            if let Err(e) = self.status.requeue(integration_id).await {
                warn!(error = %e, "could not requeue errored entry");
                lease.release(HeartbeatOutcome::Abandoned).await;
                return Err(e.into());
            }
        }

        let options = ProcessingOptions {
            reprocess: context.reprocess,
        };
        let entry = match self.status.mark_processing(integration_id, options).await {
            Ok(entry) => entry,
            Err(StatusError::NotFound(_)) => {
                lease.release(HeartbeatOutcome::Abandoned).await;
                return Ok(JobOutcome::NotFound);
            }
            Err(e) => {
                warn!(error = %e, "could not mark entry in process");
                lease.release(HeartbeatOutcome::Abandoned).await;
                return Err(e.into());
            }
        };
        let run = entry.run_stamp();
        let started_at = self.clock.now();

        if let Err(e) = self.heartbeats.start(integration_id).await {
            warn!(error = %e, "heartbeat start failed; job runs without liveness record");
        }

        info!(attempt = entry.attempts, provider = %integration.provider, "processing integration");
        let result = self.run_processor(integration).await;
        let elapsed = self.elapsed_since(started_at);

        let outcome = match result {
            ProcessingResult::Success {
                processed_items,
                total_items,
            } if processed_items > 0 => {
                match self
                    .status
                    .mark_completed(integration_id, Some(run), processed_items, elapsed)
                    .await
                {
                    Ok(_) => {
                        info!(
                            processed_items,
                            total_items,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "job completed"
                        );
                        lease.release(HeartbeatOutcome::Completed).await;
                        return Ok(JobOutcome::Completed {
                            processed_items,
                            elapsed_ms: elapsed.as_millis() as u64,
                        });
                    }
                    Err(StatusError::StaleRun(_)) => Ok(superseded()),
                    Err(e) => {
                        warn!(error = %e, "completion could not be recorded");
                        self.record_failure(
                            &entry,
                            FailureReport::new(format!("completion not recorded: {e}"))
                                .at_step("mark_completed"),
                            false,
                            elapsed,
                        )
                        .await
                    }
                }
            }
            ProcessingResult::Success { total_items, .. } => {
                self.record_failure(
                    &entry,
                    FailureReport::new("no items processed")
                        .at_step("processing")
                        .with_details(json!({ "total_items": total_items })),
                    false,
                    elapsed,
                )
                .await
            }
            ProcessingResult::TransientFailure(report) => {
                self.record_failure(&entry, report, false, elapsed).await
            }
            ProcessingResult::TerminalFailure(report) => {
                self.record_failure(&entry, report, true, elapsed).await
            }
        };

        match outcome {
            Ok(outcome) => {
                let heartbeat_outcome = match outcome {
                    JobOutcome::Terminal { .. } => HeartbeatOutcome::Failed,
                    JobOutcome::Superseded => HeartbeatOutcome::Abandoned,
                    _ => HeartbeatOutcome::Error,
                };
                lease.release(heartbeat_outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, "failure could not be recorded");
                lease.release(HeartbeatOutcome::Error).await;
                Err(e)
            }
        }
    }

    async fn run_processor(&self, integration: Integration) -> ProcessingResult {
        let reporter = ProgressReporter::new(self.heartbeats.clone(), integration.id);
        let processor = self.processor.clone();

        let task = tokio::spawn(async move { processor.process(&integration, reporter).await });
        match task.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                error!(panic = %message, "processor panicked");
                ProcessingResult::TransientFailure(
                    FailureReport::new(format!("processor panicked: {message}"))
                        .at_step("processing"),
                )
            }
            Err(join) => ProcessingResult::TransientFailure(
                FailureReport::new(format!("processing task cancelled: {join}"))
                    .at_step("processing"),
            ),
        }
    }

    async fn record_failure(
        &self,
        entry: &QueueEntry,
        report: FailureReport,
        terminal: bool,
        elapsed: Duration,
    ) -> Result<JobOutcome, OrchestratorError> {
        let id = entry.integration_id;
        let attempt = entry.attempts;
        let exhausted = attempt >= self.max_attempts;
        let message = report.message.clone();
        let critical = is_business_critical(&message);

        let run = Some(entry.run_stamp());

        if terminal || exhausted {
            match self
                .status
                .mark_failed(id, run, report.clone(), attempt, elapsed)
                .await
            {
                Ok(_) => {}
                Err(StatusError::StaleRun(_)) => return Ok(superseded()),
                Err(e) => return Err(e.into()),
            }
            self.notifier.notify(
                Alert::new(
                    AlertSeverity::Critical,
                    format!("integration {id} failed permanently"),
                    message.clone(),
                )
                .with_context(json!({
                    "integration_id": id.to_string(),
                    "attempt": attempt,
                    "max_attempts": self.max_attempts,
                    "step": report.step,
                    "terminal": terminal,
                    "attempts_exhausted": exhausted,
                })),
            );
            return Ok(JobOutcome::Terminal { attempt, message });
        }

        match self
            .status
            .mark_error(id, run, report.clone(), attempt, elapsed)
            .await
        {
            Ok(_) => {}
            Err(StatusError::StaleRun(_)) => return Ok(superseded()),
            Err(e) => return Err(e.into()),
        }
        if critical {
            self.notifier.notify(
                Alert::new(
                    AlertSeverity::Warning,
                    format!("integration {id} hit a business-critical error"),
                    message.clone(),
                )
                .with_context(json!({
                    "integration_id": id.to_string(),
                    "attempt": attempt,
                    "step": report.step,
                })),
            );
        }
        Ok(JobOutcome::Retryable { attempt, message })
    }

    fn elapsed_since(&self, started_at: DateTime<Utc>) -> Duration {
        (self.clock.now() - started_at).to_std().unwrap_or_default()
    }
}

fn superseded() -> JobOutcome {
    warn!("job was reclaimed while running; result discarded");
    JobOutcome::Superseded
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
