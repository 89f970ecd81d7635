//! Types shared by the orchestrator, the processing collaborator and the queue consumer.

use std::time::Duration;

use serde::Serialize;

use feedsync_core::FailureRecord;

use crate::slots::SlotDenial;

/// Failure description handed back by the processing collaborator.
pub type FailureReport = FailureRecord;

/// Result of one processing run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingResult {
    Success {
        processed_items: u64,
        total_items: u64,
    },
    /// Worth retrying (network errors, timeouts, rate limits).
    TransientFailure(FailureReport),
    /// Retrying cannot help (feed gone, credentials revoked, unparseable source).
    TerminalFailure(FailureReport),
}

impl ProcessingResult {
    pub fn success(processed_items: u64, total_items: u64) -> Self {
        ProcessingResult::Success {
            processed_items,
            total_items,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ProcessingResult::TransientFailure(FailureReport::new(message))
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        ProcessingResult::TerminalFailure(FailureReport::new(message))
    }
}

/// What the orchestrator did with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        processed_items: u64,
        elapsed_ms: u64,
    },
    /// Admission denied; nothing was touched. Re-enqueue after `delay`.
    RetryLater {
        #[serde(serialize_with = "serialize_denial")]
        reason: SlotDenial,
        #[serde(rename = "delay_ms", serialize_with = "serialize_millis")]
        delay: Duration,
    },
    /// Run failed and was recorded as `Error`.
    Retryable { attempt: u32, message: String },
    /// Run failed and was recorded as `Failed`; never re-enqueued automatically.
    Terminal { attempt: u32, message: String },
    /// No integration / queue entry for the id.
    NotFound,
    /// The run lost its claim while processing (slot reclaimed, entry reset or
    /// taken by a later run). Its result was discarded.
    Superseded,
}

impl JobOutcome {
    /// Whether the queue consumer may re-enqueue the job automatically.
    pub fn should_requeue(&self) -> bool {
        matches!(
            self,
            JobOutcome::RetryLater { .. } | JobOutcome::Retryable { .. }
        )
    }

    /// Suggested delay before the job is picked up again.
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            JobOutcome::RetryLater { delay, .. } => Some(*delay),
            JobOutcome::Retryable { .. } => Some(Duration::ZERO),
            _ => None,
        }
    }
}

fn serialize_denial<S: serde::Serializer>(reason: &SlotDenial, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(reason)
}

fn serialize_millis<S: serde::Serializer>(delay: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(delay.as_millis() as u64)
}

/// Per-call options of [`super::JobOrchestrator::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Allow a finished integration to be processed again.
    pub reprocess: bool,
    /// Free-form origin of the request ("schedule", "manual", ...), logged only.
    pub trigger: Option<String>,
}

impl ExecutionContext {
    pub fn reprocess() -> Self {
        Self {
            reprocess: true,
            ..Default::default()
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_retryable_outcomes_requeue() {
        let later = JobOutcome::RetryLater {
            reason: SlotDenial::CeilingReached,
            delay: Duration::from_secs(60),
        };
        assert!(later.should_requeue());
        assert_eq!(later.requeue_delay(), Some(Duration::from_secs(60)));

        assert!(
            JobOutcome::Retryable {
                attempt: 2,
                message: "timeout".into()
            }
            .should_requeue()
        );
        assert!(
            !JobOutcome::Terminal {
                attempt: 5,
                message: "timeout".into()
            }
            .should_requeue()
        );
        assert!(!JobOutcome::NotFound.should_requeue());
        assert!(!JobOutcome::Superseded.should_requeue());
        assert!(
            !JobOutcome::Completed {
                processed_items: 3,
                elapsed_ms: 10
            }
            .should_requeue()
        );
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(JobOutcome::RetryLater {
            reason: SlotDenial::CeilingReached,
            delay: Duration::from_secs(60),
        })
        .unwrap();
        assert_eq!(json["outcome"], "retry_later");
        assert_eq!(json["reason"], "ceiling reached");
        assert_eq!(json["delay_ms"], 60_000);
    }
}
