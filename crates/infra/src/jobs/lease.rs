//! Guard owning one job's slot and heartbeat for the duration of an execution.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use feedsync_core::IntegrationId;

use crate::coordination::HeartbeatOutcome;
use crate::heartbeat::HeartbeatMonitor;
use crate::slots::SlotManager;

/// Releases the slot and stops the heartbeat.
///
/// Call [`SlotLease::release`] on every normal path. If the lease is dropped
/// unreleased (early return, cancelled future, panic in the caller), `Drop`
/// spawns the same cleanup on the current tokio runtime.
///
/// With an admission expiry the slot is only released while it still carries
/// that admission; once a later run owns the slot, neither the slot nor the
/// heartbeat is touched.
pub struct SlotLease {
    integration_id: IntegrationId,
    admission: Option<DateTime<Utc>>,
    slots: Arc<SlotManager>,
    heartbeats: Arc<HeartbeatMonitor>,
    released: bool,
}

impl SlotLease {
    pub fn new(
        integration_id: IntegrationId,
        admission: Option<DateTime<Utc>>,
        slots: Arc<SlotManager>,
        heartbeats: Arc<HeartbeatMonitor>,
    ) -> Self {
        Self {
            integration_id,
            admission,
            slots,
            heartbeats,
            released: false,
        }
    }

    pub fn integration_id(&self) -> IntegrationId {
        self.integration_id
    }

    /// Stop the heartbeat with `outcome` and give the slot back. Failures are logged;
    /// an unreleased slot still expires with its TTL.
    pub async fn release(mut self, outcome: HeartbeatOutcome) {
        self.released = true;
        cleanup(
            self.integration_id,
            self.admission,
            self.slots.clone(),
            self.heartbeats.clone(),
            outcome,
        )
        .await;
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = self.integration_id;
        warn!(integration_id = %id, "slot lease dropped without release");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let slots = self.slots.clone();
                let heartbeats = self.heartbeats.clone();
                handle.spawn(cleanup(
                    id,
                    self.admission,
                    slots,
                    heartbeats,
                    HeartbeatOutcome::Abandoned,
                ));
            }
            Err(_) => {
                error!(integration_id = %id, "no runtime to release slot; it will expire");
            }
        }
    }
}

async fn cleanup(
    integration_id: IntegrationId,
    admission: Option<DateTime<Utc>>,
    slots: Arc<SlotManager>,
    heartbeats: Arc<HeartbeatMonitor>,
    outcome: HeartbeatOutcome,
) {
    let owned = match admission {
        Some(expires_at) => match slots.release_admission(integration_id, expires_at).await {
            Ok(released) => released,
            Err(e) => {
                error!(
                    integration_id = %integration_id,
                    error = %e,
                    "slot release failed; slot will expire"
                );
                true
            }
        },
        None => {
            if let Err(e) = slots.release(integration_id).await {
                error!(
                    integration_id = %integration_id,
                    error = %e,
                    "slot release failed; slot will expire"
                );
            }
            true
        }
    };

    if !owned {
        info!(integration_id = %integration_id, "slot taken over by a later run; heartbeat left to it");
        return;
    }
    if let Err(e) = heartbeats.stop(integration_id, outcome).await {
        warn!(integration_id = %integration_id, error = %e, "heartbeat stop failed");
    }
    debug!(integration_id = %integration_id, "lease released");
}
