//! Wiring of the orchestration components from stores and configuration.

use std::sync::Arc;

use feedsync_core::Clock;
use feedsync_observability::OperatorNotifier;

use crate::config::OrchestratorConfig;
use crate::coordination::{CoordinationStore, InMemoryCoordinationStore};
use crate::heartbeat::HeartbeatMonitor;
use crate::jobs::{FeedProcessor, JobOrchestrator};
use crate::queue_store::{InMemoryQueueStore, NoTenantActivity, QueueStore, TenantActivity};
use crate::slots::SlotManager;
use crate::status::StatusManager;
use crate::workers::MaintenanceWorker;

/// The shared components one worker process runs with.
#[derive(Clone)]
pub struct OrchestrationServices {
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    status: Arc<StatusManager>,
    slots: Arc<SlotManager>,
    heartbeats: Arc<HeartbeatMonitor>,
}

impl OrchestrationServices {
    pub fn build(
        config: OrchestratorConfig,
        coordination: Arc<dyn CoordinationStore>,
        queue: Arc<dyn QueueStore>,
        activity: Arc<dyn TenantActivity>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let status = Arc::new(StatusManager::new(
            queue,
            clock.clone(),
            config.transition_policy,
            config.status_conflict_retries,
        ));
        let slots = Arc::new(SlotManager::new(
            coordination.clone(),
            status.clone(),
            activity.clone(),
            clock.clone(),
            config.slots.clone(),
            config.coordination_retry.clone(),
            &config.heartbeat.worker_id,
        ));
        let heartbeats = Arc::new(HeartbeatMonitor::new(
            coordination,
            slots.clone(),
            status.clone(),
            activity,
            clock.clone(),
            config.heartbeat.clone(),
            config.coordination_retry.clone(),
        ));

        Self {
            config,
            clock,
            status,
            slots,
            heartbeats,
        }
    }

    /// Everything in process memory; for tests and local runs without stores.
    pub fn in_memory(config: OrchestratorConfig, clock: Arc<dyn Clock>) -> Self {
        let coordination = InMemoryCoordinationStore::arc(clock.clone());
        let queue = InMemoryQueueStore::arc();
        Self::build(config, coordination, queue, Arc::new(NoTenantActivity), clock)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<StatusManager> {
        self.status.clone()
    }

    pub fn slots(&self) -> Arc<SlotManager> {
        self.slots.clone()
    }

    pub fn heartbeats(&self) -> Arc<HeartbeatMonitor> {
        self.heartbeats.clone()
    }

    pub fn orchestrator(
        &self,
        processor: Arc<dyn FeedProcessor>,
        notifier: Arc<dyn OperatorNotifier>,
    ) -> JobOrchestrator {
        JobOrchestrator::new(
            &self.config,
            self.slots.clone(),
            self.status.clone(),
            self.heartbeats.clone(),
            processor,
            notifier,
            self.clock.clone(),
        )
    }

    pub fn maintenance(&self) -> MaintenanceWorker {
        MaintenanceWorker::new(self.slots.clone(), self.heartbeats.clone())
    }
}
