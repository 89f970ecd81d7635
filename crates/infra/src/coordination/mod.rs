//! Coordination store boundary (ephemeral, shared by all workers).
//!
//! The store keeps three kinds of state:
//!
//! - **Slots**: active set + expiry map + cached counter. Slot mutations are
//!   whole-state scripts (`acquire_slot`, `release_slot`, `evict_expired_slots`)
//!   so "count, maybe evict, maybe insert" happens in one round trip.
//! - **Heartbeats**: one hash per running job, plus a short-lived tombstone.
//! - **Locks**: owner-tagged keys with a TTL.
//!
//! Only the Slot Manager and Heartbeat Monitor talk to this trait; callers of
//! those components never see a store handle.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use feedsync_core::IntegrationId;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCoordinationStore;
#[cfg(feature = "redis")]
pub use redis::RedisCoordinationStore;

/// Coordination store failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    #[error("coordination store connection error: {0}")]
    Connection(String),

    #[error("coordination store command error: {0}")]
    Command(String),

    #[error("malformed coordination data: {0}")]
    Malformed(String),
}

/// Answer of the atomic admission script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAdmission {
    /// Inserted; `active` includes the new member. `expires_at` is the expiry
    /// written for it and identifies this admission on release.
    Admitted {
        active: usize,
        expires_at: DateTime<Utc>,
    },
    /// Live members already at the ceiling.
    CeilingReached { active: usize },
    /// The job is in the active set without an expiry entry.
    AlreadyActive,
}

/// One member of the active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMember {
    pub integration_id: IntegrationId,
    /// `None` when the member has no expiry entry (malformed / half-written).
    pub expires_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of the slot state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub members: Vec<SlotMember>,
    /// Cached counter, which may drift from `members.len()` until reconciled.
    pub cached_count: usize,
}

impl SlotSnapshot {
    pub fn contains(&self, id: IntegrationId) -> bool {
        self.members.iter().any(|m| m.integration_id == id)
    }

    /// Members whose expiry is still in the future.
    pub fn live_count(&self, now: DateTime<Utc>) -> usize {
        self.members
            .iter()
            .filter(|m| m.expires_at.is_some_and(|e| e > now))
            .count()
    }
}

/// Live heartbeat record of a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub integration_id: IntegrationId,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Last time the record's TTL was extended.
    pub last_renewed_at: DateTime<Utc>,
    pub current_step: String,
    /// Percentage, when the processor reports one.
    pub progress: Option<u8>,
    pub update_count: u64,
}

/// Merge applied by a heartbeat update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatTouch {
    pub step: String,
    pub progress: Option<u8>,
    pub at: DateTime<Utc>,
    /// Extend the record's TTL to this value (and stamp `last_renewed_at`).
    pub extend_ttl: Option<Duration>,
}

/// How a job's heartbeat ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatOutcome {
    Completed,
    Error,
    Failed,
    /// Reset by stuck/expired-job recovery.
    Recovered,
    /// Released without a recorded outcome (early exit, dropped lease).
    Abandoned,
}

/// Tombstone kept for a short while after a job stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalHeartbeat {
    pub integration_id: IntegrationId,
    pub worker_id: String,
    pub outcome: HeartbeatOutcome,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: DateTime<Utc>,
    pub last_step: Option<String>,
    pub update_count: u64,
}

impl FinalHeartbeat {
    /// Tombstone for a job stopping now, carried over from its live record when
    /// there is one.
    pub fn from_live(
        integration_id: IntegrationId,
        live: Option<&HeartbeatRecord>,
        fallback_worker_id: &str,
        outcome: HeartbeatOutcome,
        stopped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            integration_id,
            worker_id: live
                .map(|r| r.worker_id.clone())
                .unwrap_or_else(|| fallback_worker_id.to_string()),
            outcome,
            started_at: live.map(|r| r.started_at),
            stopped_at,
            last_step: live.map(|r| r.current_step.clone()),
            update_count: live.map(|r| r.update_count).unwrap_or(0),
        }
    }
}

/// Result of enumerating live heartbeat records.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatListing {
    pub records: Vec<HeartbeatRecord>,
    /// Keys whose content could not be decoded.
    pub malformed_keys: Vec<String>,
}

/// Shared key-value coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomic admission: re-admit / evict own entry, reconcile, check ceiling, insert.
    async fn acquire_slot(
        &self,
        integration_id: IntegrationId,
        now: DateTime<Utc>,
        ttl: Duration,
        max_slots: usize,
    ) -> Result<SlotAdmission, CoordinationError>;

    /// Scripted release; returns the resynced count.
    async fn release_slot(&self, integration_id: IntegrationId) -> Result<usize, CoordinationError>;

    /// Scripted release of one admission: the member is removed only while its
    /// expiry still equals `expires_at`. Returns whether it was removed; `false`
    /// means the slot is gone or was re-admitted since.
    async fn release_admission(
        &self,
        integration_id: IntegrationId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoordinationError>;

    /// Unscripted release used when the scripted path keeps failing.
    async fn force_release_slot(
        &self,
        integration_id: IntegrationId,
    ) -> Result<usize, CoordinationError>;

    /// Evict members whose expiry passed (and, with `evict_unbounded`, members
    /// without expiry). Resyncs the counter; returns the evicted ids.
    async fn evict_expired_slots(
        &self,
        now: DateTime<Utc>,
        evict_unbounded: bool,
    ) -> Result<Vec<IntegrationId>, CoordinationError>;

    async fn slot_snapshot(&self) -> Result<SlotSnapshot, CoordinationError>;

    async fn put_heartbeat(
        &self,
        record: &HeartbeatRecord,
        ttl: Duration,
    ) -> Result<(), CoordinationError>;

    /// Merge an update into an existing record. `None` when no record exists.
    async fn touch_heartbeat(
        &self,
        integration_id: IntegrationId,
        touch: &HeartbeatTouch,
    ) -> Result<Option<HeartbeatRecord>, CoordinationError>;

    async fn get_heartbeat(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<HeartbeatRecord>, CoordinationError>;

    async fn list_heartbeats(&self) -> Result<HeartbeatListing, CoordinationError>;

    /// Returns whether a record was removed.
    async fn delete_heartbeat(&self, integration_id: IntegrationId)
    -> Result<bool, CoordinationError>;

    /// Remove a record by raw key (used for undecodable entries).
    async fn purge_heartbeat_key(&self, key: &str) -> Result<(), CoordinationError>;

    async fn put_final_heartbeat(
        &self,
        record: &FinalHeartbeat,
        ttl: Duration,
    ) -> Result<(), CoordinationError>;

    async fn get_final_heartbeat(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<FinalHeartbeat>, CoordinationError>;

    /// Take `name` for `owner` if free. Returns whether the lock was taken.
    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration)
    -> Result<bool, CoordinationError>;

    /// Release `name` if still held by `owner`.
    async fn unlock(&self, name: &str, owner: &str) -> Result<(), CoordinationError>;
}
