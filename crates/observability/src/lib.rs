//! Tracing, logging and operator alerting (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Operator notification channel for failures that need a human.
pub mod notify;

pub use notify::{
    Alert, AlertSeverity, OperatorNotifier, RecordingNotifier, TracingNotifier, is_business_critical,
};
