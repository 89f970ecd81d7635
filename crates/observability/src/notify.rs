//! Operator escalation.
//!
//! Retryable failures are only logged. Terminal failures, and failures whose
//! message says a human has to act (bad credentials, vanished feed, broken XML),
//! are additionally pushed through an [`OperatorNotifier`].

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Message fragments that always warrant an operator alert, matched case-insensitively.
pub const CRITICAL_PATTERNS: &[&str] = &[
    "xml malformed",
    "invalid xml",
    "authentication",
    "unauthorized",
    "forbidden",
    "feed not found",
    "http 403",
    "http 404",
    "certificate",
];

/// Whether an error message matches one of the [`CRITICAL_PATTERNS`].
pub fn is_business_critical(message: &str) -> bool {
    let lower = message.to_lowercase();
    CRITICAL_PATTERNS.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Something a human should look at soon; the job may still recover.
    Warning,
    /// The job will not run again without manual intervention.
    Critical,
}

/// A notification for the operator channel.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub subject: String,
    pub message: String,
    /// Structured context (integration id, attempts, elapsed time...).
    pub context: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            subject: subject.into(),
            message: message.into(),
            context: serde_json::Value::Null,
            raised_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Sink for operator alerts (mail, chat, pager...). Must not block for long.
pub trait OperatorNotifier: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Emits alerts as structured error logs tagged `alert = true`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl OperatorNotifier for TracingNotifier {
    fn notify(&self, alert: Alert) {
        ::tracing::error!(
            alert = true,
            severity = ?alert.severity,
            subject = %alert.subject,
            context = %alert.context,
            "{}",
            alert.message
        );
    }
}

/// Keeps alerts in memory (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl OperatorNotifier for RecordingNotifier {
    fn notify(&self, alert: Alert) {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_patterns_are_case_insensitive() {
        assert!(is_business_critical("Feed Not Found at origin"));
        assert!(is_business_critical("HTTP 403 from provider"));
        assert!(!is_business_critical("connection reset by peer"));
    }

    #[test]
    fn recording_notifier_keeps_alerts() {
        let n = RecordingNotifier::new();
        n.notify(Alert::new(AlertSeverity::Critical, "integration failed", "boom"));
        assert_eq!(n.alerts().len(), 1);
        assert_eq!(n.alerts()[0].severity, AlertSeverity::Critical);
    }
}
