//! Durable work-item records and the queue status machine.
//!
//! There is exactly one `QueueEntry` per integration. It is created on first
//! enqueue and re-used for every later run: entering `InProcess` wipes the
//! execution fields, so anything worth keeping from a failed run must already be
//! in `attempts` / the error fields by then.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, TransitionError};
use crate::id::IntegrationId;

/// Queue status of an integration's work item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a worker.
    Pending,
    /// Owned by a running worker.
    InProcess,
    /// Last run succeeded.
    Done,
    /// Stopped by an operator.
    Stopped,
    /// Last run failed; eligible for automatic retry.
    Error,
    /// Attempts exhausted; needs manual intervention.
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProcess => "in_process",
            QueueStatus::Done => "done",
            QueueStatus::Stopped => "stopped",
            QueueStatus::Error => "error",
            QueueStatus::Failed => "failed",
        }
    }

    /// Whether `next` is an edge of the queue state machine.
    ///
    /// `Done -> InProcess` is deliberately absent; see [`QueueStatus::check_transition`].
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, InProcess | Stopped | Error)
                | (InProcess, Done | Stopped | Error | Failed)
                | (Stopped, Pending | Error)
                | (Error, Pending)
                | (Failed, Pending)
                | (Done, Pending)
        )
    }

    /// Validate a transition under the given policy.
    ///
    /// `reprocess` is the explicit request needed to move a finished entry straight
    /// back into processing; without it that edge is refused under every policy.
    pub fn check_transition(
        self,
        next: QueueStatus,
        policy: TransitionPolicy,
        reprocess: bool,
    ) -> Result<TransitionCheck, TransitionError> {
        if self == QueueStatus::Done && next == QueueStatus::InProcess {
            return if reprocess {
                Ok(TransitionCheck::Legal)
            } else {
                Err(TransitionError::ReprocessNotRequested)
            };
        }

        if self.can_transition_to(next) {
            return Ok(TransitionCheck::Legal);
        }

        match policy {
            TransitionPolicy::Permissive => Ok(TransitionCheck::Tolerated),
            TransitionPolicy::Strict => Err(TransitionError::Invalid {
                from: self,
                to: next,
            }),
        }
    }
}

impl core::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in_process" => Ok(QueueStatus::InProcess),
            "done" => Ok(QueueStatus::Done),
            "stopped" => Ok(QueueStatus::Stopped),
            "error" => Ok(QueueStatus::Error),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// How transitions outside the state machine are treated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Log and apply.
    #[default]
    Permissive,
    /// Reject with `TransitionError::Invalid`.
    Strict,
}

impl FromStr for TransitionPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "permissive" => Ok(TransitionPolicy::Permissive),
            "strict" => Ok(TransitionPolicy::Strict),
            other => Err(DomainError::validation(format!(
                "unknown transition policy: {other}"
            ))),
        }
    }
}

/// Outcome of a successful transition check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransitionCheck {
    Legal,
    /// Outside the state machine but allowed by a permissive policy.
    Tolerated,
}

/// What went wrong in a failed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message: String,
    /// Processing step that was running when the failure happened.
    pub step: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl FailureRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step: None,
            details: None,
        }
    }

    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Identity of one run of a queue entry.
///
/// Taken from the entry returned when the run entered `InProcess`; a later
/// write for that run is rejected once the entry has moved on to another run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RunStamp {
    pub started_at: Option<DateTime<Utc>>,
    pub attempt: u32,
}

/// Durable work item of one integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub integration_id: IntegrationId,
    pub priority: i32,
    pub status: QueueStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<u64>,
    /// Runs started since the last success (recoveries count as one more).
    pub attempts: u32,
    pub error_message: Option<String>,
    pub last_error_step: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp, used as the optimistic concurrency version.
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(integration_id: IntegrationId, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            integration_id,
            priority,
            status: QueueStatus::Pending,
            started_at: None,
            ended_at: None,
            completed_at: None,
            execution_time_ms: None,
            attempts: 0,
            error_message: None,
            last_error_step: None,
            error_details: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Start a new run: clean execution record, one more attempt.
    pub fn begin_run(&mut self, now: DateTime<Utc>) {
        self.status = QueueStatus::InProcess;
        self.started_at = Some(now);
        self.ended_at = None;
        self.completed_at = None;
        self.execution_time_ms = None;
        self.error_message = None;
        self.last_error_step = None;
        self.error_details = None;
        self.attempts += 1;
    }

    pub fn run_stamp(&self) -> RunStamp {
        RunStamp {
            started_at: self.started_at,
            attempt: self.attempts,
        }
    }

    /// The entry is still in process for `run`.
    pub fn ensure_run(&self, run: RunStamp) -> Result<(), TransitionError> {
        if self.status == QueueStatus::InProcess && self.run_stamp() == run {
            Ok(())
        } else {
            Err(TransitionError::StaleRun)
        }
    }

    /// Put a retryable entry back in line. The failed run was already charged.
    pub fn requeue(&mut self) {
        self.status = QueueStatus::Pending;
    }

    /// Record a successful run. Attempts count consecutive failures, so they reset.
    pub fn complete(
        &mut self,
        processed_items: u64,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if processed_items == 0 {
            return Err(TransitionError::ZeroItems);
        }
        self.status = QueueStatus::Done;
        self.ended_at = Some(now);
        self.completed_at = Some(now);
        self.execution_time_ms = Some(duration_ms);
        self.attempts = 0;
        self.error_message = None;
        self.last_error_step = None;
        self.error_details = None;
        Ok(())
    }

    /// Record a failed run as `Error` (retryable) or `Failed` (terminal).
    pub fn fail(
        &mut self,
        status: QueueStatus,
        failure: FailureRecord,
        attempt: u32,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) {
        debug_assert!(matches!(status, QueueStatus::Error | QueueStatus::Failed));
        self.status = status;
        self.ended_at = Some(now);
        self.completed_at = None;
        self.execution_time_ms = Some(duration_ms);
        self.attempts = attempt;
        self.error_message = Some(failure.message);
        self.last_error_step = failure.step;
        self.error_details = failure.details;
    }

    /// Return an interrupted entry to the queue.
    ///
    /// The interrupted run is charged as an extra attempt.
    pub fn reset_pending(&mut self, reason: impl Into<String>, step: Option<String>, now: DateTime<Utc>) {
        if let Some(started) = self.started_at {
            if self.status == QueueStatus::InProcess {
                self.execution_time_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
        }
        self.status = QueueStatus::Pending;
        self.ended_at = Some(now);
        self.completed_at = None;
        self.attempts += 1;
        self.error_message = Some(reason.into());
        self.last_error_step = step;
        self.error_details = None;
    }

    /// Bump the version. Strictly increasing even when the clock does not move.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let floor = self.updated_at + chrono::Duration::microseconds(1);
        self.updated_at = if now > self.updated_at { now } else { floor };
    }

    /// In process and started at or before `cutoff`.
    pub fn started_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == QueueStatus::InProcess && self.started_at.is_some_and(|s| s <= cutoff)
    }
}
