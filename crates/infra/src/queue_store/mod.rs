//! Durable queue store: integrations and their queue entries.
//!
//! Every status change goes through [`QueueStore::transition`], which locks both
//! rows, checks the caller's observed version, applies a pure mutation and writes
//! the result back guarded by the locked version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use feedsync_core::{Integration, IntegrationId, QueueEntry, TransitionError, UserId};

pub mod activity;
pub mod in_memory;
pub mod postgres;

pub use activity::{NoTenantActivity, PostgresTenantActivity, RecordedTenantActivity, TenantActivity};
pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueStoreError {
    #[error("integration not found: {0}")]
    NotFound(IntegrationId),

    #[error("integration already queued: {0}")]
    AlreadyQueued(IntegrationId),

    /// The row changed between the caller's read and the locked read.
    #[error("optimistic conflict on {integration_id}: observed {observed}, found {found}")]
    Conflict {
        integration_id: IntegrationId,
        observed: DateTime<Utc>,
        found: DateTime<Utc>,
    },

    /// The guarded update matched no row.
    #[error("queue row vanished during update: {0}")]
    RowVanished(IntegrationId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("undecodable row: {0}")]
    Decode(String),
}

/// Pure mutation applied to the locked rows.
pub type TransitionFn<'a> =
    &'a (dyn Fn(&mut Integration, &mut QueueEntry) -> Result<(), TransitionError> + Send + Sync);

/// A queue entry that has been in process for too long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub integration_id: IntegrationId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Register an integration with a fresh queue entry.
    async fn enqueue(
        &self,
        integration: &Integration,
        entry: &QueueEntry,
    ) -> Result<(), QueueStoreError>;

    async fn load(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<(Integration, QueueEntry)>, QueueStoreError>;

    /// Lock both rows, compare the entry version against `observed`, apply
    /// `apply`, bump the version and persist. Returns the persisted rows.
    async fn transition(
        &self,
        integration_id: IntegrationId,
        observed: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        apply: TransitionFn<'_>,
    ) -> Result<(Integration, QueueEntry), QueueStoreError>;

    /// The subset of `ids` whose queue entry is in process.
    async fn in_process_among(
        &self,
        ids: &[IntegrationId],
    ) -> Result<Vec<IntegrationId>, QueueStoreError>;

    /// Entries in process that started at or before `started_before`.
    async fn list_stalled(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<StalledJob>, QueueStoreError>;
}
