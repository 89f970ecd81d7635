//! Infrastructure layer: coordination store (Redis), durable queue store
//! (Postgres), and the orchestration components built on top of them.
//!
//! Components, leaf to root:
//!
//! - [`status::StatusManager`]: the only writer of durable queue state
//! - [`slots::SlotManager`]: bounded admission through the coordination store
//! - [`heartbeat::HeartbeatMonitor`]: liveness records and stuck-job recovery
//! - [`jobs::JobOrchestrator`]: runs one integration job end to end
//! - [`workers::MaintenanceWorker`]: periodic reconciliation of both stores
//!
//! [`components::OrchestrationServices`] wires them together from a config.

pub mod components;
pub mod config;
pub mod coordination;
pub mod heartbeat;
pub mod jobs;
pub mod queue_store;
pub mod retry;
pub mod slots;
pub mod status;
pub mod workers;

pub use components::OrchestrationServices;
pub use config::{ConfigError, HeartbeatConfig, OrchestratorConfig, SlotConfig, StoreConfig};
pub use coordination::{
    CoordinationError, CoordinationStore, HeartbeatOutcome, HeartbeatRecord, InMemoryCoordinationStore,
};
#[cfg(feature = "redis")]
pub use coordination::RedisCoordinationStore;
pub use heartbeat::{HeartbeatMonitor, ProgressReporter, StuckJob};
pub use jobs::{
    ExecutionContext, FailureReport, FeedProcessor, JobOrchestrator, JobOutcome, OrchestratorError,
    ProcessingResult, SlotLease,
};
pub use queue_store::{
    InMemoryQueueStore, NoTenantActivity, PostgresQueueStore, PostgresTenantActivity, QueueStore,
    QueueStoreError, RecordedTenantActivity, StalledJob, TenantActivity,
};
pub use retry::RetryPolicy;
pub use slots::{CleanupError, CleanupReport, SlotAcquisition, SlotDenial, SlotManager};
pub use status::{ProcessingOptions, StatusError, StatusManager};
pub use workers::{MaintenanceHandle, MaintenanceReport, MaintenanceWorker};
